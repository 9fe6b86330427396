//! # llama-cli
//!
//! Interactive front end for a [`llama_chat::SessionController`].
//!
//! The binary wires: arguments → [`EngineConfig`] → runtime → session → REPL.
//! This library half holds the parts that do not need a terminal: REPL command
//! parsing, flag overrides and the canned mock runtime.

use std::path::PathBuf;

use llama_chat::EngineConfig;
use llama_engine::mock::MockRuntime;

/// One line typed at the chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    /// Plain text to send as the next user turn.
    Say(String),
    /// `/reset`: forget the conversation, keep the model.
    Reset,
    /// `/stats`: print the telemetry log.
    Stats,
    /// `/load <path>`
    Load(PathBuf),
    /// `/unload`
    Unload,
    /// `/quit` or `/exit`
    Quit,
    /// `/help`
    Help,
    /// Blank line.
    Empty,
    /// A `/command` that is not recognized, or one missing its argument.
    Invalid(String),
}

impl ReplCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return ReplCommand::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return ReplCommand::Say(line.to_string());
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (command, ""),
        };
        match name {
            "reset" | "clear" => ReplCommand::Reset,
            "stats" => ReplCommand::Stats,
            "load" if !arg.is_empty() => ReplCommand::Load(PathBuf::from(arg)),
            "load" => ReplCommand::Invalid("usage: /load <path>".into()),
            "unload" => ReplCommand::Unload,
            "quit" | "exit" => ReplCommand::Quit,
            "help" => ReplCommand::Help,
            other => ReplCommand::Invalid(format!("unknown command: /{other}")),
        }
    }
}

pub const REPL_HELP: &str = "\
commands:
  /reset          forget the conversation
  /stats          show telemetry
  /load <path>    load another model
  /unload         release the model
  /quit           exit";

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub n_ctx: Option<u32>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub seed: Option<u32>,
}

impl Overrides {
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(n_ctx) = self.n_ctx {
            config.context.n_ctx = n_ctx;
            config.context.n_batch = config.context.n_batch.min(n_ctx);
        }
        if let Some(max_tokens) = self.max_tokens {
            config.generation.max_new_tokens = max_tokens;
        }
        if let Some(t) = self.temperature {
            config.sampling = std::mem::take(&mut config.sampling).override_temperature(t);
        }
        if let Some(seed) = self.seed {
            config.sampling = std::mem::take(&mut config.sampling).override_seed(seed);
        }
    }
}

/// Scripted runtime used by `--mock`.
pub fn demo_runtime() -> MockRuntime {
    MockRuntime::new().with_reply(
        "This is the mock runtime. It replays a canned reply so the session, \
         streaming and telemetry paths can be tried without a model.",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_sampling::SamplerStage;

    #[test]
    fn parses_plain_text() {
        assert_eq!(
            ReplCommand::parse("  hello there \n"),
            ReplCommand::Say("hello there".into())
        );
        assert_eq!(ReplCommand::parse("   "), ReplCommand::Empty);
    }

    #[test]
    fn parses_commands() {
        assert_eq!(ReplCommand::parse("/reset"), ReplCommand::Reset);
        assert_eq!(ReplCommand::parse("/stats"), ReplCommand::Stats);
        assert_eq!(ReplCommand::parse("/unload"), ReplCommand::Unload);
        assert_eq!(ReplCommand::parse("/exit"), ReplCommand::Quit);
        assert_eq!(
            ReplCommand::parse("/load  models/tiny.gguf "),
            ReplCommand::Load(PathBuf::from("models/tiny.gguf"))
        );
    }

    #[test]
    fn load_needs_a_path() {
        assert!(matches!(ReplCommand::parse("/load"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn unknown_command() {
        assert_eq!(
            ReplCommand::parse("/frobnicate now"),
            ReplCommand::Invalid("unknown command: /frobnicate".into())
        );
    }

    #[test]
    fn overrides_apply_to_config() {
        let mut config = EngineConfig::default();
        Overrides {
            n_ctx: Some(256),
            max_tokens: Some(32),
            temperature: Some(0.2),
            seed: Some(7),
        }
        .apply(&mut config);

        assert_eq!(config.context.n_ctx, 256);
        assert_eq!(config.context.n_batch, 256);
        assert_eq!(config.generation.max_new_tokens, 32);
        assert!(config
            .sampling
            .stages()
            .contains(&SamplerStage::Temperature { t: 0.2 }));
        assert!(config
            .sampling
            .stages()
            .contains(&SamplerStage::Distribution { seed: 7 }));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_overrides_change_nothing() {
        let mut config = EngineConfig::default();
        Overrides::default().apply(&mut config);
        assert_eq!(config, EngineConfig::default());
    }
}
