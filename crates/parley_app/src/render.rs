//! Line-oriented terminal output for the view model.
//!
//! The renderer remembers what it already printed and only emits the
//! difference, so the typewriter reveal shows up as text appended to the
//! current line.

use std::path::PathBuf;

use parley_core::{
    AppViewModel, ChatMessage, NoticeKind, PluginOpPhase, PluginOperation, PluginPhase, Role,
    TransferKind, TransferPhase,
};

#[derive(Debug, Default)]
pub struct Renderer {
    header: Option<(PathBuf, Option<String>)>,
    printed_messages: usize,
    /// Bytes of the streaming partial already on screen.
    streamed: usize,
    in_stream: bool,
    status: Vec<String>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to write for `view`, possibly empty.
    pub fn frame(&mut self, view: &AppViewModel) -> String {
        let mut out = String::new();

        let header = (view.data_dir.clone(), view.session_name.clone());
        if self.header.as_ref() != Some(&header) {
            self.end_stream_line(&mut out);
            out.push_str(&format!(
                "== {} [{}] ==\n",
                header.1.as_deref().unwrap_or("no session"),
                header.0.display()
            ));
            self.header = Some(header);
            self.printed_messages = 0;
            self.status.clear();
        }

        if view.messages.len() < self.printed_messages {
            self.printed_messages = 0;
        }

        match &view.stream {
            Some(stream) => {
                self.print_messages(&view.messages, &mut out);
                if !self.in_stream {
                    out.push_str("assistant> ");
                    self.in_stream = true;
                    self.streamed = 0;
                }
                if let Some(fresh) = stream.partial.get(self.streamed..) {
                    out.push_str(fresh);
                    self.streamed = stream.partial.len();
                }
            }
            None if self.in_stream => {
                // The finished response is the newest assistant message.
                let finished = view
                    .messages
                    .iter()
                    .enumerate()
                    .skip(self.printed_messages)
                    .rev()
                    .find(|(_, message)| message.role == Role::Assistant)
                    .map(|(index, _)| index);
                match finished {
                    Some(index) => {
                        self.print_messages(&view.messages[..index], &mut out);
                        let content = &view.messages[index].content;
                        out.push_str(content.get(self.streamed..).unwrap_or_default());
                        out.push('\n');
                        self.printed_messages = index + 1;
                    }
                    None => out.push('\n'),
                }
                self.in_stream = false;
                self.streamed = 0;
                self.print_messages(&view.messages, &mut out);
            }
            None => self.print_messages(&view.messages, &mut out),
        }

        let status = status_lines(view);
        if status != self.status {
            if !status.is_empty() {
                self.end_stream_line(&mut out);
                for line in &status {
                    out.push_str(line);
                    out.push('\n');
                }
                if self.in_stream {
                    out.push_str("assistant> ");
                    out.push_str(view.stream.as_ref().map_or("", |s| s.partial.as_str()));
                }
            }
            self.status = status;
        }
        out
    }

    fn print_messages(&mut self, messages: &[ChatMessage], out: &mut String) {
        for message in messages.iter().skip(self.printed_messages) {
            out.push_str(&format_message(message));
            out.push('\n');
        }
        self.printed_messages = self.printed_messages.max(messages.len());
    }

    fn end_stream_line(&mut self, out: &mut String) {
        if self.in_stream {
            out.push('\n');
        }
    }
}

fn format_message(message: &ChatMessage) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    format!("{speaker}> {}", message.content)
}

/// Dialogs and notices, one line each.
pub fn status_lines(view: &AppViewModel) -> Vec<String> {
    let mut lines = Vec::new();

    if let Some(modal) = &view.plugin_modal {
        let verb = match modal.operation {
            PluginOperation::Starting => "Starting",
            PluginOperation::Stopping => "Stopping",
        };
        lines.push(match modal.phase {
            PluginPhase::Waiting => format!("[plugins] {verb} plugins..."),
            PluginPhase::Unresponsive => format!(
                "[plugins] Still running after {}s: {}. /wait or /force",
                modal.elapsed_secs,
                modal.unresponsive.join(", ")
            ),
            PluginPhase::Error => format!(
                "[plugins] {verb} failed: {}. /dismiss",
                modal.error.as_deref().unwrap_or("unknown error")
            ),
            PluginPhase::Complete => format!("[plugins] {verb} complete"),
        });
    }

    if let Some(op) = &view.plugin_operation {
        lines.push(match op.phase {
            PluginOpPhase::Enabling => format!("[plugin] Enabling {}...", op.plugin_id),
            PluginOpPhase::Disabling => format!("[plugin] Disabling {}...", op.plugin_id),
            PluginOpPhase::Complete => format!("[plugin] {} updated. /dismiss", op.plugin_id),
            PluginOpPhase::Error => format!(
                "[plugin] {} failed: {}. /dismiss",
                op.plugin_id,
                op.error.as_deref().unwrap_or("unknown error")
            ),
        });
    }

    if let Some(prompt) = &view.passphrase_prompt {
        lines.push(format!(
            "[datadir] Passphrase for {} (or /cancel):",
            prompt.target.display()
        ));
        if let Some(error) = &prompt.error {
            lines.push(format!("[datadir] {error}"));
        }
    } else if view.switching_data_dir {
        lines.push("[datadir] Switching data directory...".to_string());
    }

    if let Some(transfer) = &view.transfer {
        let what = match &transfer.kind {
            TransferKind::Export { session_id, path } => {
                format!("Exporting {session_id} to {}", path.display())
            }
            TransferKind::Import { path } => format!("Importing {}", path.display()),
        };
        lines.push(match transfer.phase {
            TransferPhase::Running => format!("[transfer] {what}... /cancel"),
            TransferPhase::Cancelling => format!("[transfer] {what}: cancelling..."),
            TransferPhase::CleaningUp => "[transfer] Removing partial export...".to_string(),
        });
    }

    if let Some(notice) = &view.notice {
        let tag = match notice.kind {
            NoticeKind::Info => "info",
            NoticeKind::Error => "error",
        };
        lines.push(format!("[{tag}] {}: {}", notice.title, notice.body));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parley_core::{Notice, StreamPhase, StreamView, TransferState};
    use pretty_assertions::assert_eq;

    fn view() -> AppViewModel {
        AppViewModel {
            data_dir: PathBuf::from("/data/a"),
            session_name: Some("Chat".to_string()),
            ..AppViewModel::default()
        }
    }

    fn message(role: Role, content: &str) -> ChatMessage {
        ChatMessage::new(role, content, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap())
    }

    fn streaming(partial: &str) -> Option<StreamView> {
        Some(StreamView {
            phase: StreamPhase::Streaming,
            partial: partial.to_string(),
            revealed: 1,
            total: 3,
        })
    }

    #[test]
    fn typewriter_appends_to_one_line() {
        let mut renderer = Renderer::new();
        let mut view = view();
        view.messages = vec![message(Role::User, "Hello")];
        assert_eq!(renderer.frame(&view), "== Chat [/data/a] ==\nyou> Hello\n");

        view.stream = streaming("He");
        assert_eq!(renderer.frame(&view), "assistant> He");
        view.stream = streaming("Hello");
        assert_eq!(renderer.frame(&view), "llo");

        view.stream = None;
        view.messages.push(message(Role::Assistant, "Hello!"));
        assert_eq!(renderer.frame(&view), "!\n");
        assert_eq!(renderer.frame(&view), "");
    }

    #[test]
    fn notices_print_once() {
        let mut renderer = Renderer::new();
        let mut view = view();
        renderer.frame(&view);

        view.notice = Some(Notice::info("Session In Use", "Open elsewhere"));
        assert_eq!(
            renderer.frame(&view),
            "[info] Session In Use: Open elsewhere\n"
        );
        assert_eq!(renderer.frame(&view), "");
    }

    #[test]
    fn transfer_status_follows_the_phase() {
        let mut view = view();
        view.transfer = Some(TransferState {
            transfer_id: 1,
            kind: TransferKind::Import {
                path: PathBuf::from("/tmp/chat.json"),
            },
            phase: TransferPhase::Running,
        });
        assert_eq!(
            status_lines(&view),
            vec!["[transfer] Importing /tmp/chat.json... /cancel".to_string()]
        );

        if let Some(transfer) = view.transfer.as_mut() {
            transfer.phase = TransferPhase::Cancelling;
        }
        assert_eq!(
            status_lines(&view),
            vec!["[transfer] Importing /tmp/chat.json: cancelling...".to_string()]
        );
    }

    #[test]
    fn switching_session_reprints_the_history() {
        let mut renderer = Renderer::new();
        let mut view = view();
        view.messages = vec![message(Role::User, "one")];
        renderer.frame(&view);

        view.session_name = Some("Other".to_string());
        view.messages = vec![message(Role::Assistant, "two")];
        assert_eq!(
            renderer.frame(&view),
            "== Other [/data/a] ==\nassistant> two\n"
        );
    }
}
