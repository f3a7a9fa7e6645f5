//! Line-oriented keyboard control.
//!
//! | Input | Action |
//! |-------|--------|
//! | `t` | record / close base / arm overdub on the current scene |
//! | `s` | select the next scene |
//! | `m` | mute or unmute the current scene |
//! | `l <n>` | toggle mute of loop `n` in the current scene |
//! | `+ <n>` / `- <n>` | loop `n` volume up / down |
//! | `d` | delete the last loop of the current scene |
//! | `r` / `R` | reset the current scene / every scene |
//! | `p` | print status as JSON |
//! | `q` | quit |

use looper_core::{error::Result, LooperController};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    ToggleState,
    ToggleScene,
    ToggleSceneMuted,
    ToggleLoopMuted(usize),
    IncrementLoopVol(usize),
    DecrementLoopVol(usize),
    DeleteLastLoop,
    ResetScene,
    ResetAll,
    PrintStatus,
    Quit,
}

pub fn parse_command(line: &str) -> std::result::Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Err("empty command".into());
    };
    let position = |arg: Option<&str>| -> std::result::Result<usize, String> {
        arg.ok_or_else(|| format!("'{word}' needs a loop number"))?
            .parse::<usize>()
            .map_err(|_| format!("invalid loop number for '{word}'"))
    };

    let command = match word {
        "t" => ConsoleCommand::ToggleState,
        "s" => ConsoleCommand::ToggleScene,
        "m" => ConsoleCommand::ToggleSceneMuted,
        "l" => ConsoleCommand::ToggleLoopMuted(position(words.next())?),
        "+" => ConsoleCommand::IncrementLoopVol(position(words.next())?),
        "-" => ConsoleCommand::DecrementLoopVol(position(words.next())?),
        "d" => ConsoleCommand::DeleteLastLoop,
        "r" => ConsoleCommand::ResetScene,
        "R" => ConsoleCommand::ResetAll,
        "p" => ConsoleCommand::PrintStatus,
        "q" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(command)
}

/// Apply a loop or scene edit to the current scene. `PrintStatus` and `Quit`
/// belong to the caller and are ignored here.
pub fn execute(controller: &mut LooperController, command: ConsoleCommand) -> Result<()> {
    let scene = controller.current_scene();
    match command {
        ConsoleCommand::ToggleState => {
            let state = controller.toggle_state()?;
            info!(scene, ?state, "transport");
        }
        ConsoleCommand::ToggleScene => {
            let next = controller.toggle_scene()?;
            info!(next, "next scene selected");
        }
        ConsoleCommand::ToggleSceneMuted => {
            let muted = controller.toggle_scene_muted();
            info!(scene, muted, "scene mute");
        }
        ConsoleCommand::ToggleLoopMuted(position) => {
            let muted = controller.toggle_loop_muted(scene, position)?;
            info!(scene, position, muted, "loop mute");
        }
        ConsoleCommand::IncrementLoopVol(position) => {
            let vol = controller.increment_loop_vol(scene, position)?;
            info!(scene, position, vol, "loop volume");
        }
        ConsoleCommand::DecrementLoopVol(position) => {
            let vol = controller.decrement_loop_vol(scene, position)?;
            info!(scene, position, vol, "loop volume");
        }
        ConsoleCommand::DeleteLastLoop => controller.delete_last_loop()?,
        ConsoleCommand::ResetScene => controller.reset_current_scene()?,
        ConsoleCommand::ResetAll => controller.reset_all()?,
        ConsoleCommand::PrintStatus | ConsoleCommand::Quit => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use looper_core::{new_looper, EngineConfig, TransportState};

    #[test]
    fn parses_single_letter_and_indexed_commands() {
        assert_eq!(parse_command("t"), Ok(ConsoleCommand::ToggleState));
        assert_eq!(parse_command("  R  "), Ok(ConsoleCommand::ResetAll));
        assert_eq!(parse_command("l 2"), Ok(ConsoleCommand::ToggleLoopMuted(2)));
        assert_eq!(parse_command("- 0"), Ok(ConsoleCommand::DecrementLoopVol(0)));
    }

    #[test]
    fn rejects_missing_or_bad_arguments() {
        assert!(parse_command("").is_err());
        assert!(parse_command("+").is_err());
        assert!(parse_command("l x").is_err());
        assert!(parse_command("zz").is_err());
    }

    #[test]
    fn execute_drives_the_controller() {
        let config = EngineConfig {
            record_buffer_frames: 1 << 14,
            buffer_margin_frames: 64,
            min_loop_duration_ms: 10,
            ..EngineConfig::default()
        };
        let (_engine, mut controller) = new_looper(config, 8_000, 32).unwrap();

        execute(&mut controller, ConsoleCommand::ToggleState).unwrap();
        assert_eq!(
            controller.transport_state(0).unwrap(),
            TransportState::RecordingBase
        );
        assert!(execute(&mut controller, ConsoleCommand::ToggleLoopMuted(0)).is_err());
        execute(&mut controller, ConsoleCommand::ToggleScene).unwrap();
        assert_eq!(controller.next_scene(), 1);
    }
}
