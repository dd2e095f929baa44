//! Line commands typed at the prompt.

use std::path::PathBuf;

use parley_core::{AppViewModel, Msg, PluginPhase, Secret, ShutdownChoice, TransferPhase};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("unknown command /{0} (try /help)")]
    UnknownCommand(String),
    #[error("/{command} needs {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },
}

pub const HELP: &str = "\
/new                 start a new session
/load <id>           open a saved session
/cancel              stop the current response or transfer
/export <id> <path>  write a session to a file
/import <path>       add a session from an exported file
/datadir <path>      switch to another data directory
/plugins on|off      start or stop the plugin system
/enable <plugin>     enable one plugin
/disable <plugin>    disable one plugin
/wait, /force        answer the unresponsive plugins prompt
/dismiss             close the topmost notice or dialog
/quit                exit";

/// What the prompt currently expects, taken from the view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputContext {
    pub passphrase_prompt: bool,
    pub plugin_error: bool,
    pub plugin_operation: bool,
    pub notice: bool,
    /// An export or import can still be cancelled.
    pub transfer: bool,
}

impl InputContext {
    pub fn from_view(view: &AppViewModel) -> Self {
        Self {
            passphrase_prompt: view.passphrase_prompt.is_some(),
            plugin_error: view
                .plugin_modal
                .as_ref()
                .is_some_and(|modal| modal.phase == PluginPhase::Error),
            plugin_operation: view.plugin_operation.is_some(),
            notice: view.notice.is_some(),
            transfer: view
                .transfer
                .as_ref()
                .is_some_and(|transfer| transfer.phase == TransferPhase::Running),
        }
    }
}

/// Parsed form of one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Msg(Msg),
    Help,
    Nothing,
}

pub fn parse(line: &str, context: InputContext) -> Result<Input, InputError> {
    let line = line.trim_end_matches(['\r', '\n']);

    // While the passphrase prompt is open every line except /cancel is the passphrase.
    if context.passphrase_prompt {
        return Ok(match line.trim() {
            "/cancel" => Input::Msg(Msg::PassphraseCancelled),
            _ => Input::Msg(Msg::PassphraseSubmitted(Secret::new(line))),
        });
    }

    let trimmed = line.trim();
    let Some(command_line) = trimmed.strip_prefix('/') else {
        if trimmed.is_empty() {
            return Ok(Input::Nothing);
        }
        return Ok(Input::Msg(Msg::Submit(trimmed.to_string())));
    };

    let (command, argument) = match command_line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (command_line, ""),
    };

    let msg = match command {
        "help" => return Ok(Input::Help),
        "quit" | "exit" => Msg::Quit,
        "cancel" if context.transfer => Msg::CancelTransfer,
        "cancel" => Msg::CancelStreaming,
        "new" => Msg::NewSession,
        "load" => Msg::LoadSession(required(argument, "load", "a session id")?.to_string()),
        "export" => {
            let (session_id, path) = required(argument, "export", "a session id and a path")?
                .split_once(char::is_whitespace)
                .ok_or(InputError::MissingArgument {
                    command: "export",
                    what: "a session id and a path",
                })?;
            Msg::ExportSession {
                session_id: session_id.to_string(),
                path: PathBuf::from(path.trim()),
            }
        }
        "import" => Msg::ImportSession(PathBuf::from(required(argument, "import", "a path")?)),
        "datadir" => Msg::SwitchDataDir(PathBuf::from(required(argument, "datadir", "a path")?)),
        "plugins" => match argument {
            "on" => Msg::SetPluginsEnabled(true),
            "off" => Msg::SetPluginsEnabled(false),
            _ => {
                return Err(InputError::MissingArgument {
                    command: "plugins",
                    what: "on or off",
                })
            }
        },
        "enable" => Msg::EnablePlugin(required(argument, "enable", "a plugin id")?.to_string()),
        "disable" => Msg::DisablePlugin(required(argument, "disable", "a plugin id")?.to_string()),
        "wait" => Msg::ShutdownChoice(ShutdownChoice::Wait),
        "force" => Msg::ShutdownChoice(ShutdownChoice::Force),
        "dismiss" => {
            if context.plugin_error {
                Msg::DismissPluginSystem
            } else if context.plugin_operation {
                Msg::DismissPluginOperation
            } else if context.notice {
                Msg::DismissNotice
            } else {
                return Ok(Input::Nothing);
            }
        }
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(Input::Msg(msg))
}

fn required<'a>(
    argument: &'a str,
    command: &'static str,
    what: &'static str,
) -> Result<&'a str, InputError> {
    if argument.is_empty() {
        Err(InputError::MissingArgument { command, what })
    } else {
        Ok(argument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn msg(line: &str) -> Msg {
        match parse(line, InputContext::default()) {
            Ok(Input::Msg(msg)) => msg,
            other => panic!("expected a message for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_is_a_chat_message() {
        assert_eq!(msg("  Hello there \n"), Msg::Submit("Hello there".to_string()));
        assert_eq!(parse("   ", InputContext::default()), Ok(Input::Nothing));
    }

    #[test]
    fn commands_map_to_messages() {
        assert_eq!(msg("/quit"), Msg::Quit);
        assert_eq!(msg("/plugins on"), Msg::SetPluginsEnabled(true));
        assert_eq!(msg("/disable search"), Msg::DisablePlugin("search".to_string()));
        assert_eq!(
            msg("/datadir /tmp/other data"),
            Msg::SwitchDataDir(PathBuf::from("/tmp/other data"))
        );
        assert_eq!(msg("/force"), Msg::ShutdownChoice(ShutdownChoice::Force));
    }

    #[test]
    fn transfers_parse_and_cancel_takes_priority() {
        assert_eq!(
            msg("/export 20260301-120000000 /tmp/my chat.json"),
            Msg::ExportSession {
                session_id: "20260301-120000000".to_string(),
                path: PathBuf::from("/tmp/my chat.json"),
            }
        );
        assert_eq!(
            msg("/import /tmp/chat.json"),
            Msg::ImportSession(PathBuf::from("/tmp/chat.json"))
        );
        assert_eq!(
            parse("/export only-an-id", InputContext::default()),
            Err(InputError::MissingArgument {
                command: "export",
                what: "a session id and a path"
            })
        );

        let running = InputContext {
            transfer: true,
            ..InputContext::default()
        };
        assert_eq!(parse("/cancel", running), Ok(Input::Msg(Msg::CancelTransfer)));
        assert_eq!(msg("/cancel"), Msg::CancelStreaming);
    }

    #[test]
    fn missing_arguments_and_unknown_commands_are_errors() {
        assert_eq!(
            parse("/load", InputContext::default()),
            Err(InputError::MissingArgument {
                command: "load",
                what: "a session id"
            })
        );
        assert_eq!(
            parse("/plugins maybe", InputContext::default()),
            Err(InputError::MissingArgument {
                command: "plugins",
                what: "on or off"
            })
        );
        assert_eq!(
            parse("/teleport", InputContext::default()),
            Err(InputError::UnknownCommand("teleport".to_string()))
        );
    }

    #[test]
    fn passphrase_prompt_takes_the_raw_line() {
        let context = InputContext {
            passphrase_prompt: true,
            ..InputContext::default()
        };
        assert_eq!(
            parse(" secret with spaces\n", context),
            Ok(Input::Msg(Msg::PassphraseSubmitted(Secret::new(
                " secret with spaces"
            ))))
        );
        assert_eq!(
            parse("/cancel", context),
            Ok(Input::Msg(Msg::PassphraseCancelled))
        );
    }

    #[test]
    fn dismiss_targets_the_topmost_dialog() {
        let everything = InputContext {
            passphrase_prompt: false,
            plugin_error: true,
            plugin_operation: true,
            notice: true,
            transfer: true,
        };
        assert_eq!(
            parse("/dismiss", everything),
            Ok(Input::Msg(Msg::DismissPluginSystem))
        );
        let notice_only = InputContext {
            notice: true,
            ..InputContext::default()
        };
        assert_eq!(
            parse("/dismiss", notice_only),
            Ok(Input::Msg(Msg::DismissNotice))
        );
        assert_eq!(parse("/dismiss", InputContext::default()), Ok(Input::Nothing));
    }
}
