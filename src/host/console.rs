//! Terminal host
//!
//! Mounts one panel, persists its state as a JSON file from a writer task,
//! paints every render pass to the log (log panel entries only once) and
//! turns stdin lines into settings edits:
//!
//! ```text
//! set <field> <value>   edit a field of the general node (value parsed as JSON)
//! restart               manual restart
//! show                  print the settings tree
//! quit                  unmount and exit
//! ```

use super::{PanelContext, PanelRegistration, RenderDone, SettingsAction, SettingsTree};
use crate::config::HostConfig;
use crate::settings::GENERAL_NODE;
use crate::view::PanelView;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

/// Line command typed into the console
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Set { field: String, value: Value },
    Restart,
    Show,
    Help,
    Quit,
}

/// Parse one stdin line
pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb {
        "set" => {
            let (field, raw) = match rest.split_once(char::is_whitespace) {
                Some((field, raw)) => (field, raw.trim()),
                None => return Err("usage: set <field> <value>".to_string()),
            };
            // bare words are taken as strings
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok(ConsoleCommand::Set {
                field: field.to_string(),
                value,
            })
        }
        "restart" => Ok(ConsoleCommand::Restart),
        "show" => Ok(ConsoleCommand::Show),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        "" => Err("empty command".to_string()),
        other => Err(format!("unknown command: {}", other)),
    }
}

/// `PanelContext` backed by a state file and the log
struct ConsoleContext {
    state_file: PathBuf,
    /// Keys forced over the persisted blob at mount
    overrides: Map<String, Value>,
    editor: Mutex<Option<SettingsTree>>,
    saves: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Log panel entries already printed
    painted_logs: Mutex<usize>,
}

impl ConsoleContext {
    /// Must run inside a tokio runtime
    fn new(state_file: PathBuf, overrides: Map<String, Value>) -> Self {
        let (saves, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_states(state_file.clone(), rx));
        Self {
            state_file,
            overrides,
            editor: Mutex::new(None),
            saves: Mutex::new(Some(saves)),
            writer: Mutex::new(Some(writer)),
            painted_logs: Mutex::new(0),
        }
    }

    fn editor(&self) -> Option<SettingsTree> {
        self.editor.lock().clone()
    }

    /// Stop accepting state and wait until the last one is on disk
    async fn flush(&self) {
        self.saves.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!("State writer failed: {}", e);
            }
        }
    }
}

/// Write queued states in order; of a burst only the newest is written
async fn write_states(path: PathBuf, mut rx: mpsc::UnboundedReceiver<Value>) {
    while let Some(mut state) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            state = newer;
        }
        let json = match serde_json::to_string_pretty(&state) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize panel state: {}", e);
                continue;
            }
        };
        match tokio::fs::write(&path, json).await {
            Ok(()) => debug!("Saved panel state to {:?}", path),
            Err(e) => warn!("Failed to save panel state to {:?}: {}", path, e),
        }
    }
}

/// Copy of `view` without the log entries an earlier paint printed
fn unpainted(view: &PanelView, painted: &mut usize) -> PanelView {
    let mut view = view.clone();
    if let Some(ref mut log) = view.log {
        let total = log.entries.len();
        let skip = if *painted > total { 0 } else { *painted };
        log.entries.drain(..skip);
        *painted = total;
    }
    view
}

fn read_state(path: &Path) -> Option<Value> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            debug!("No persisted state at {:?}: {}", path, e);
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring unreadable state file {:?}: {}", path, e);
            None
        }
    }
}

impl PanelContext for ConsoleContext {
    fn initial_state(&self) -> Option<Value> {
        let persisted = read_state(&self.state_file);
        if self.overrides.is_empty() {
            return persisted;
        }
        let mut state = match persisted {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.overrides {
            state.insert(key.clone(), value.clone());
        }
        Some(Value::Object(state))
    }

    fn save_state(&self, state: Value) {
        let queued = match self.saves.lock().as_ref() {
            Some(saves) => saves.send(state).is_ok(),
            None => false,
        };
        if !queued {
            warn!("State writer is closed, not saving to {:?}", self.state_file);
        }
    }

    fn update_settings_editor(&self, tree: SettingsTree) {
        *self.editor.lock() = Some(tree);
    }

    fn paint(&self, view: &PanelView) {
        let view = unpainted(view, &mut self.painted_logs.lock());
        info!("{}", view);
    }
}

pub struct ConsoleHost {
    config: HostConfig,
    overrides: Map<String, Value>,
}

impl ConsoleHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            overrides: Map::new(),
        }
    }

    /// Force a settings key over the persisted state, e.g. from the command line
    pub fn with_state_override(mut self, key: &str, value: Value) -> Self {
        self.overrides.insert(key.to_string(), value);
        self
    }

    /// Mount the panel and drive it until `quit` or ctrl-c
    pub async fn run(&self, registration: &PanelRegistration) -> Result<(), Box<dyn std::error::Error>> {
        let context = Arc::new(ConsoleContext::new(
            self.config.state_file.clone(),
            self.overrides.clone(),
        ));
        info!(
            "Mounting panel \"{}\" (state file {:?})",
            registration.name, self.config.state_file
        );
        let mut panel = registration.mount(context.clone());

        let period = Duration::from_millis(self.config.render_interval_ms);
        let mut renders = time::interval(period);
        renders.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = renders.tick() => {
                    let (done, rx) = RenderDone::new();
                    panel.on_render(done);
                    if time::timeout(period, rx).await.is_err() {
                        warn!("Render pass was not acknowledged within {:?}", period);
                    }
                }
                line = lines.next_line(), if stdin_open => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!("stdin closed, commands disabled");
                            stdin_open = false;
                            continue;
                        }
                        Err(e) => {
                            warn!("Failed to read stdin: {}", e);
                            stdin_open = false;
                            continue;
                        }
                    };
                    match parse_command(&line) {
                        Ok(ConsoleCommand::Set { field, value }) => {
                            let path = vec![GENERAL_NODE.to_string(), field];
                            panel.on_settings_actions(vec![SettingsAction::update(path, value)]);
                        }
                        Ok(ConsoleCommand::Restart) => panel.restart(),
                        Ok(ConsoleCommand::Show) => match context.editor() {
                            Some(tree) => match serde_json::to_string_pretty(&tree) {
                                Ok(json) => info!("Settings:\n{}", json),
                                Err(e) => warn!("Failed to format settings: {}", e),
                            },
                            None => info!("No settings published yet"),
                        },
                        Ok(ConsoleCommand::Help) => {
                            info!("Commands: set <field> <value>, restart, show, quit");
                        }
                        Ok(ConsoleCommand::Quit) => break,
                        Err(e) => warn!("{}", e),
                    }
                }
                _ = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
            }
        }

        info!("Unmounting panel \"{}\"", registration.name);
        panel.unmount().await;
        context.flush().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::state::{LogEntry, LogLevel, ViewState};
    use crate::settings::{StreamSettings, FIELD_SERVER_URL};
    use crate::view;
    use serde_json::json;

    fn temp_state_file() -> PathBuf {
        std::env::temp_dir().join(format!(
            "stream-panel-state-{}.json",
            uuid::Uuid::new_v4().simple()
        ))
    }

    #[test]
    fn test_parse_set_with_json_value() {
        assert_eq!(
            parse_command("set streamId 7").unwrap(),
            ConsoleCommand::Set {
                field: "streamId".to_string(),
                value: json!(7)
            }
        );
        assert_eq!(
            parse_command("set debug true").unwrap(),
            ConsoleCommand::Set {
                field: "debug".to_string(),
                value: json!(true)
            }
        );
    }

    #[test]
    fn test_parse_set_bare_word_is_string() {
        assert_eq!(
            parse_command("  set serverUrl ws://gw:8188/  ").unwrap(),
            ConsoleCommand::Set {
                field: "serverUrl".to_string(),
                value: json!("ws://gw:8188/")
            }
        );
        assert_eq!(
            parse_command("set label Front door").unwrap(),
            ConsoleCommand::Set {
                field: "label".to_string(),
                value: json!("Front door")
            }
        );
    }

    #[test]
    fn test_parse_other_commands() {
        assert_eq!(parse_command("restart").unwrap(), ConsoleCommand::Restart);
        assert_eq!(parse_command("exit").unwrap(), ConsoleCommand::Quit);
        assert_eq!(parse_command("show").unwrap(), ConsoleCommand::Show);
        assert!(parse_command("set streamId").is_err());
        assert!(parse_command("").is_err());
        assert!(parse_command("jump").is_err());
    }

    #[tokio::test]
    async fn test_state_file_round_trip() {
        let path = temp_state_file();
        let context = ConsoleContext::new(path.clone(), Map::new());
        assert!(context.initial_state().is_none());

        context.save_state(json!({"streamId": 2}));
        context.save_state(json!({"streamId": 3}));
        context.flush().await;
        assert_eq!(
            context.initial_state(),
            Some(json!({"streamId": 3}))
        );

        // writer is gone after flush
        context.save_state(json!({"streamId": 4}));
        assert_eq!(
            context.initial_state(),
            Some(json!({"streamId": 3}))
        );

        std::fs::write(&path, "not json").unwrap();
        assert!(context.initial_state().is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_overrides_win_over_persisted_state() {
        let path = temp_state_file();
        std::fs::write(&path, r#"{"streamId": 3, "label": "Cam"}"#).unwrap();

        let mut overrides = Map::new();
        overrides.insert("streamId".to_string(), json!(8));
        let context = ConsoleContext::new(path.clone(), overrides);
        assert_eq!(
            context.initial_state(),
            Some(json!({"streamId": 8, "label": "Cam"}))
        );
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_server_url_override_beats_persisted_url() {
        let path = temp_state_file();
        std::fs::write(&path, r#"{"serverUrl": "ws://old:8188/", "streamId": 3}"#).unwrap();

        let host = ConsoleHost::new(HostConfig {
            state_file: path.clone(),
            ..Default::default()
        })
        .with_state_override(FIELD_SERVER_URL, json!("ws://cli:8188/"));
        let context = ConsoleContext::new(path.clone(), host.overrides.clone());
        let state = context.initial_state().unwrap();
        assert_eq!(state["serverUrl"], json!("ws://cli:8188/"));
        assert_eq!(state["streamId"], json!(3));

        let store = crate::settings::SettingsStore::new(Some(&state), "ws://default:8188/");
        assert_eq!(store.settings().server_url, "ws://cli:8188/");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_paint_prints_log_entries_once() {
        let context = ConsoleContext::new(temp_state_file(), Map::new());
        let mut settings = StreamSettings::with_server_url("ws://localhost:8188/");
        settings.debug = true;
        let entry = |message: &str| LogEntry {
            message: message.to_string(),
            level: LogLevel::Info,
        };

        let mut state = ViewState {
            logs: vec![entry("one"), entry("two")],
            ..Default::default()
        };
        let first = unpainted(&view::render(&state, &settings), &mut context.painted_logs.lock());
        assert_eq!(first.log.unwrap().entries.len(), 2);

        state.logs.push(entry("three"));
        let second = unpainted(&view::render(&state, &settings), &mut context.painted_logs.lock());
        assert_eq!(second.log.unwrap().entries, vec![entry("three")]);

        let third = unpainted(&view::render(&state, &settings), &mut context.painted_logs.lock());
        assert!(third.log.unwrap().entries.is_empty());
        assert_eq!(third.video, second.video);
        context.flush().await;
    }
}
