//! The dispatch loop.
//!
//! Stdin lines, clock ticks and effect completions all arrive as `Event`s on
//! one unbounded channel and are applied to the state with `update` strictly
//! one at a time. The resulting effects go to the `EffectRunner` in order.
//! Nothing else mutates the state.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use parley_core::{update, AppState, Msg, PluginPhase};
use parley_engine::{Environment, EnvironmentLoader};
use parley_logging::{parley_debug, parley_info, set_event_seq};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::effects::{EffectRunner, Event, Flow};
use crate::input::{self, Input, InputContext};
use crate::persistence::SystemConfigStore;
use crate::render::Renderer;

const MIN_CLOCK_TICK: Duration = Duration::from_millis(10);

pub async fn run(
    system: Arc<SystemConfigStore>,
    loader: Arc<EnvironmentLoader>,
    environment: Environment,
) -> anyhow::Result<()> {
    let settings = system.snapshot().settings;
    let resume_session = system.active_session(&environment.data_dir);
    let mut state = AppState::new(
        settings.clone(),
        environment.summary(),
        resume_session,
        Utc::now(),
    );

    let (event_tx, mut events) = mpsc::unbounded_channel();
    spawn_stdin_reader(event_tx.clone());
    spawn_clock(event_tx.clone(), settings.clock_tick().max(MIN_CLOCK_TICK));
    let mut runner = EffectRunner::new(event_tx, loader, system, environment);

    let mut renderer = Renderer::new();
    let mut stdout = std::io::stdout();
    let mut stdin_open = true;
    let mut seq: u64 = 0;
    let mut next = Some(Msg::Booted);

    loop {
        let msg = match next.take() {
            Some(msg) => msg,
            None => {
                let Some(event) = events.recv().await else {
                    break;
                };
                match event {
                    Event::Input(Some(line)) => {
                        match input::parse(&line, InputContext::from_view(&state.view())) {
                            Ok(Input::Msg(msg)) => msg,
                            Ok(Input::Help) => {
                                writeln!(stdout, "{}", input::HELP).context("writing to stdout")?;
                                continue;
                            }
                            Ok(Input::Nothing) => continue,
                            Err(err) => {
                                writeln!(stdout, "{err}").context("writing to stdout")?;
                                continue;
                            }
                        }
                    }
                    // End of input asks to quit; the loop keeps running until the core exits.
                    Event::Input(None) => {
                        stdin_open = false;
                        Msg::Quit
                    }
                    other => match runner.absorb(other) {
                        Some(msg) => msg,
                        None => continue,
                    },
                }
            }
        };

        seq += 1;
        set_event_seq(seq);
        if !matches!(msg, Msg::Tick { .. } | Msg::NoOp) {
            parley_debug!("Dispatch {:?}", msg);
        }

        let (updated, effects) = update(state, msg);
        state = updated;

        if state.consume_dirty() {
            let text = renderer.frame(&state.view());
            if !text.is_empty() {
                write!(stdout, "{text}").context("writing to stdout")?;
                stdout.flush().context("flushing stdout")?;
            }
        }

        if runner.run(effects) == Flow::Exit {
            break;
        }

        // Nobody is left to answer a plugin prompt; quitting again forces it.
        if !stdin_open && awaiting_answer(&state) {
            next = Some(Msg::Quit);
        }
    }

    parley_info!("Dispatch loop finished after {} events", seq);
    set_event_seq(0);
    runner.shutdown();
    Ok(())
}

fn awaiting_answer(state: &AppState) -> bool {
    state
        .plugin_system()
        .is_some_and(|system| matches!(system.phase, PluginPhase::Unresponsive | PluginPhase::Error))
}

/// Forwards stdin lines until end of input.
fn spawn_stdin_reader(events: mpsc::UnboundedSender<Event>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if events.send(Event::Input(Some(line))).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    parley_debug!("stdin closed: {}", err);
                    break;
                }
            }
        }
        let _ = events.send(Event::Input(None));
    });
}

/// The only source of wall-clock time for the core.
fn spawn_clock(events: mpsc::UnboundedSender<Event>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if events.send(Event::Clock(Utc::now())).is_err() {
                break;
            }
        }
    });
}
