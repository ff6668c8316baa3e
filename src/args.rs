//! llama-server command line construction.
//!
//! Tuning flags are described by [`FLAGS`], a table pairing each CLI flag
//! with the config field it reads and the rule that decides when the flag is
//! left out so llama-server falls back to its own default.

use crate::config::{FlashAttn, LlamaServerConfig};

/// When a configured value is left off the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Omit {
    /// Always emitted when set
    Never,
    /// Omitted for negative numbers (the `-1` sentinel)
    Negative,
    /// Omitted for zero and negative numbers
    NonPositive,
    /// Omitted for the empty string
    Empty,
    /// Boolean switch: emitted only when `true`
    False,
}

/// A configured value, as read from [`LlamaServerConfig`]
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Text(String),
    Switch(bool),
}

impl ArgValue {
    fn is_omitted(&self, omit: Omit) -> bool {
        match (omit, self) {
            (_, ArgValue::Switch(v)) => !*v,
            (Omit::Never, _) => false,
            (Omit::Negative, ArgValue::Int(v)) => *v < 0,
            (Omit::Negative, ArgValue::Float(v)) => *v < 0.0,
            (Omit::NonPositive, ArgValue::Int(v)) => *v <= 0,
            (Omit::NonPositive, ArgValue::Float(v)) => *v <= 0.0,
            (Omit::Empty, ArgValue::Text(v)) => v.trim().is_empty(),
            _ => false,
        }
    }

    fn render(&self) -> Option<String> {
        match self {
            ArgValue::Int(v) => Some(v.to_string()),
            ArgValue::Float(v) => Some(v.to_string()),
            ArgValue::Text(v) => Some(v.clone()),
            ArgValue::Switch(_) => None,
        }
    }
}

/// One row of the flag table
pub struct FlagSpec {
    pub field: &'static str,
    pub flag: &'static str,
    pub omit: Omit,
    pub read: fn(&LlamaServerConfig) -> Option<ArgValue>,
}

fn int(v: Option<i64>) -> Option<ArgValue> {
    v.map(ArgValue::Int)
}

fn float(v: Option<f64>) -> Option<ArgValue> {
    v.map(ArgValue::Float)
}

fn text(v: Option<String>) -> Option<ArgValue> {
    v.map(ArgValue::Text)
}

fn switch(v: Option<bool>) -> Option<ArgValue> {
    v.map(ArgValue::Switch)
}

macro_rules! flag {
    ($field:ident, $flag:literal, $omit:ident, $read:ident) => {
        FlagSpec {
            field: stringify!($field),
            flag: $flag,
            omit: Omit::$omit,
            read: |c: &LlamaServerConfig| $read(c.$field.clone()),
        }
    };
}

/// Tuning flags in emission order.
pub const FLAGS: &[FlagSpec] = &[
    flag!(ctx_size, "-c", NonPositive, int),
    flag!(batch_size, "-b", NonPositive, int),
    flag!(ubatch_size, "-ub", NonPositive, int),
    flag!(parallel, "-np", NonPositive, int),
    flag!(cont_batching, "--cont-batching", False, switch),
    flag!(threads, "-t", Negative, int),
    flag!(threads_batch, "-tb", Negative, int),
    flag!(gpu_layers, "-ngl", Negative, int),
    flag!(main_gpu, "-mg", Negative, int),
    flag!(split_mode, "-sm", Empty, text),
    flag!(tensor_split, "--tensor-split", Empty, text),
    flag!(n_cpu_moe, "--n-cpu-moe", Never, int),
    flag!(no_mmap, "--no-mmap", False, switch),
    flag!(mlock, "--mlock", False, switch),
    flag!(cache_type_k, "-ctk", Empty, text),
    flag!(cache_type_v, "-ctv", Empty, text),
    flag!(n_predict, "-n", Negative, int),
    flag!(seed, "-s", Negative, int),
    flag!(temperature, "--temp", Negative, float),
    flag!(top_k, "--top-k", Negative, int),
    flag!(top_p, "--top-p", Negative, float),
    flag!(min_p, "--min-p", Negative, float),
    flag!(repeat_penalty, "--repeat-penalty", Negative, float),
    flag!(repeat_last_n, "--repeat-last-n", Negative, int),
    flag!(presence_penalty, "--presence-penalty", Never, float),
    flag!(frequency_penalty, "--frequency-penalty", Never, float),
    flag!(rope_freq_base, "--rope-freq-base", NonPositive, float),
    flag!(rope_freq_scale, "--rope-freq-scale", NonPositive, float),
    flag!(embedding, "--embedding", False, switch),
    flag!(jinja, "--jinja", False, switch),
    flag!(chat_template, "--chat-template", Empty, text),
    flag!(api_key, "--api-key", Empty, text),
    flag!(timeout, "-to", NonPositive, int),
    flag!(models_max, "--models-max", Negative, int),
];

/// Build llama-server command line arguments.
pub fn build_args(config: &LlamaServerConfig) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(model) = config.model_path.as_deref().filter(|m| !m.is_empty()) {
        args.push("-m".to_string());
        args.push(model.to_string());
    } else if let Some(dir) = &config.base_path {
        args.push("--models-dir".to_string());
        args.push(dir.display().to_string());
    }

    args.push("--host".to_string());
    args.push(config.host.clone());
    args.push("--port".to_string());
    args.push(config.port.to_string());

    for spec in FLAGS {
        let Some(value) = (spec.read)(config) else {
            continue;
        };
        if value.is_omitted(spec.omit) {
            continue;
        }
        args.push(spec.flag.to_string());
        if let Some(rendered) = value.render() {
            args.push(rendered);
        }
    }

    match config.flash_attn {
        Some(FlashAttn::On) => args.push("-fa".to_string()),
        Some(FlashAttn::Off) => args.push("--no-flash-attn".to_string()),
        Some(FlashAttn::Auto) | None => {}
    }

    args.extend(config.server_args.iter().cloned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|a| a == flag)
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.windows(2)
            .find(|w| w[0] == flag)
            .map(|w| w[1].as_str())
    }

    #[test]
    fn test_threads_gpu_layers_flash_attn_off() {
        let config = LlamaServerConfig {
            threads: Some(-1),
            gpu_layers: Some(20),
            flash_attn: Some(FlashAttn::Off),
            ..Default::default()
        };

        let args = build_args(&config);
        assert_eq!(value_of(&args, "-ngl"), Some("20"));
        assert!(has_flag(&args, "--no-flash-attn"));
        assert!(!has_flag(&args, "-t"));
        assert!(!has_flag(&args, "-fa"));
    }

    #[test]
    fn test_host_and_port_always_present() {
        let args = build_args(&LlamaServerConfig::default());
        assert_eq!(
            args,
            vec!["--host", "127.0.0.1", "--port", "8080"]
        );
    }

    #[test]
    fn test_model_path_takes_precedence_over_models_dir() {
        let config = LlamaServerConfig {
            model_path: Some("/models/a.gguf".to_string()),
            base_path: Some(PathBuf::from("/models")),
            ..Default::default()
        };
        let args = build_args(&config);
        assert_eq!(value_of(&args, "-m"), Some("/models/a.gguf"));
        assert!(!has_flag(&args, "--models-dir"));

        let config = LlamaServerConfig {
            base_path: Some(PathBuf::from("/models")),
            ..Default::default()
        };
        let args = build_args(&config);
        assert_eq!(value_of(&args, "--models-dir"), Some("/models"));
        assert!(!has_flag(&args, "-m"));
    }

    #[test]
    fn test_flash_attn_tri_state() {
        let on = LlamaServerConfig {
            flash_attn: Some(FlashAttn::On),
            ..Default::default()
        };
        assert!(has_flag(&build_args(&on), "-fa"));

        let auto = LlamaServerConfig {
            flash_attn: Some(FlashAttn::Auto),
            ..Default::default()
        };
        let args = build_args(&auto);
        assert!(!has_flag(&args, "-fa"));
        assert!(!has_flag(&args, "--no-flash-attn"));
    }

    #[test]
    fn test_n_cpu_moe_zero_is_emitted() {
        let config = LlamaServerConfig {
            n_cpu_moe: Some(0),
            ..Default::default()
        };
        assert_eq!(value_of(&build_args(&config), "--n-cpu-moe"), Some("0"));
    }

    #[test]
    fn test_sentinels_never_emitted() {
        let config = LlamaServerConfig {
            ctx_size: Some(0),
            batch_size: Some(-1),
            ubatch_size: Some(0),
            parallel: Some(-1),
            cont_batching: Some(false),
            threads: Some(-1),
            threads_batch: Some(-1),
            gpu_layers: Some(-1),
            main_gpu: Some(-1),
            split_mode: Some(String::new()),
            tensor_split: Some(String::new()),
            no_mmap: Some(false),
            mlock: Some(false),
            cache_type_k: Some(String::new()),
            cache_type_v: Some("  ".to_string()),
            n_predict: Some(-1),
            seed: Some(-1),
            temperature: Some(-1.0),
            top_k: Some(-1),
            top_p: Some(-1.0),
            min_p: Some(-1.0),
            repeat_penalty: Some(-1.0),
            repeat_last_n: Some(-1),
            rope_freq_base: Some(0.0),
            rope_freq_scale: Some(0.0),
            embedding: Some(false),
            jinja: Some(false),
            chat_template: Some(String::new()),
            api_key: Some(String::new()),
            timeout: Some(0),
            models_max: Some(-1),
            ..Default::default()
        };

        let args = build_args(&config);
        for spec in FLAGS.iter().filter(|s| s.omit != Omit::Never) {
            assert!(
                !has_flag(&args, spec.flag),
                "{} ({}) emitted for its sentinel value",
                spec.flag,
                spec.field
            );
        }
    }

    #[test]
    fn test_values_and_switches() {
        let config = LlamaServerConfig {
            ctx_size: Some(4096),
            temperature: Some(0.7),
            jinja: Some(true),
            seed: Some(42),
            ..Default::default()
        };
        let args = build_args(&config);
        assert_eq!(value_of(&args, "-c"), Some("4096"));
        assert_eq!(value_of(&args, "--temp"), Some("0.7"));
        assert_eq!(value_of(&args, "-s"), Some("42"));
        let jinja = args.iter().position(|a| a == "--jinja").unwrap();
        // switches carry no value
        assert!(args.get(jinja + 1).is_none_or(|next| next.starts_with('-')));
    }

    #[test]
    fn test_server_args_appended_last() {
        let config = LlamaServerConfig {
            gpu_layers: Some(99),
            flash_attn: Some(FlashAttn::On),
            server_args: vec!["--verbose".to_string(), "--log-disable".to_string()],
            ..Default::default()
        };
        let args = build_args(&config);
        assert_eq!(&args[args.len() - 2..], ["--verbose", "--log-disable"]);
    }

    #[test]
    fn test_deterministic() {
        let config = LlamaServerConfig {
            base_path: Some(PathBuf::from("/models")),
            ctx_size: Some(8192),
            top_p: Some(0.9),
            n_cpu_moe: Some(4),
            ..Default::default()
        };
        assert_eq!(build_args(&config), build_args(&config));
    }
}
