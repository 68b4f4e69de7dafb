//! Line-oriented command console.
//!
//! Reads one command per line from stdin and drives a [`PlaybackSession`]
//! with it. Commands run in their own tasks, so a slow agent never blocks
//! the prompt; `status` shows whatever the projector has published so far.

use std::io;
use std::ops::ControlFlow;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, info};

use crate::commands::QueueTarget;
use crate::host::PlaybackSession;
use crate::state::{AudioQuality, RepeatMode};

/// One console line, parsed as if it were a command line.
#[derive(Parser, Debug)]
#[command(name = "console", no_binary_name = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// Start playback
    Play {
        /// Shuffle the queue first
        #[arg(long)]
        shuffle: bool,
    },
    /// Pause playback
    Pause,
    /// Stop playback
    Stop,
    /// Play if paused, pause if playing
    Toggle,
    /// Skip to the next queue item
    Next,
    /// Go back to the previous queue item
    #[command(alias = "prev")]
    Previous,
    /// Stop, then play the queue from the top
    Restart,
    /// Jump to a position in the current item
    Seek { seconds: u64 },
    /// Replace the queue with an album, playlist or song
    Queue { kind: QueueKind, id: String },
    /// Set shuffle mode
    Shuffle { state: Switch },
    /// Set repeat mode
    Repeat { mode: RepeatMode },
    /// Keep playing similar music when the queue runs out
    Autoplay { state: Switch },
    /// Set streaming quality
    Quality { quality: AudioQuality },
    /// Set volume between 0 and 1
    Volume { level: f64 },
    /// Play the queue item at an index
    Skip { index: usize },
    /// Move a queue item to another index
    Move { from: usize, to: usize },
    /// Open the audio output picker, optionally anchored at a point
    Airplay {
        #[arg(requires = "y", allow_negative_numbers = true)]
        x: Option<i32>,
        #[arg(allow_negative_numbers = true)]
        y: Option<i32>,
    },
    /// Open the agent's web inspector
    Inspector,
    /// Pause or resume time updates
    Visible { state: Switch },
    /// Show now playing and behaviour settings
    Status,
    /// Show the queue
    List,
    /// Show raw frames exchanged with the agent
    Traffic,
    /// Stop the agent and exit
    #[command(alias = "exit")]
    Quit,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Album,
    Playlist,
    Song,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    #[value(aliases = ["true", "yes"])]
    On,
    #[value(aliases = ["false", "no"])]
    Off,
}

impl From<Switch> for bool {
    fn from(switch: Switch) -> Self {
        switch == Switch::On
    }
}

impl ConsoleCommand {
    /// Parse one line. `help` and `help <command>` come back as
    /// [`clap::error::ErrorKind::DisplayHelp`].
    pub fn parse(line: &str) -> Result<Self, clap::Error> {
        ConsoleLine::try_parse_from(line.split_whitespace()).map(|parsed| parsed.command)
    }
}

/// Usage text listing every command.
pub fn help() -> String {
    ConsoleLine::command().render_help().to_string()
}

fn queue_target(kind: QueueKind, id: String) -> QueueTarget {
    match kind {
        QueueKind::Album => QueueTarget::Album(id),
        QueueKind::Playlist => QueueTarget::Playlist(id),
        QueueKind::Song => QueueTarget::Song(id),
    }
}

/// Parsed commands from a line-oriented input; blank lines are skipped.
pub struct CommandReader<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin> CommandReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            lines: input.lines(),
        }
    }

    /// `None` at end of input.
    pub async fn next_command(&mut self) -> io::Result<Option<Result<ConsoleCommand, clap::Error>>> {
        while let Some(line) = self.lines.next_line().await? {
            if !line.trim().is_empty() {
                return Ok(Some(ConsoleCommand::parse(&line)));
            }
        }
        Ok(None)
    }
}

/// Read commands from `input` until `quit` or end of input.
pub async fn run(session: &PlaybackSession, input: impl AsyncBufRead + Unpin) -> io::Result<()> {
    let mut reader = CommandReader::new(input);
    while let Some(parsed) = reader.next_command().await? {
        match parsed {
            Ok(command) => {
                if execute(session, command).await.is_break() {
                    break;
                }
            }
            // Help goes to stdout, usage errors to stderr.
            Err(e) => {
                let _ = e.print();
            }
        }
    }
    debug!("Console input closed");
    Ok(())
}

/// Carry out one command against the session.
pub async fn execute(session: &PlaybackSession, command: ConsoleCommand) -> ControlFlow<()> {
    let commands = session.commands().clone();
    match command {
        ConsoleCommand::Play { shuffle } => {
            tokio::spawn(async move { commands.play(shuffle.then_some(true)).await });
        }
        ConsoleCommand::Pause => {
            tokio::spawn(async move { commands.pause().await });
        }
        ConsoleCommand::Stop => {
            tokio::spawn(async move { commands.stop().await });
        }
        ConsoleCommand::Toggle => {
            tokio::spawn(async move { commands.toggle_playback().await });
        }
        ConsoleCommand::Next => {
            tokio::spawn(async move { commands.next().await });
        }
        ConsoleCommand::Previous => {
            tokio::spawn(async move { commands.previous().await });
        }
        ConsoleCommand::Restart => {
            tokio::spawn(async move { commands.clear_and_play().await });
        }
        ConsoleCommand::Seek { seconds } => {
            tokio::spawn(async move { commands.seek_to_time(seconds).await });
        }
        ConsoleCommand::Queue { kind, id } => {
            let target = queue_target(kind, id);
            tokio::spawn(async move { commands.set_queue(&target).await });
        }
        ConsoleCommand::Shuffle { state } => {
            tokio::spawn(async move { commands.set_shuffle(state.into()).await });
        }
        ConsoleCommand::Repeat { mode } => {
            tokio::spawn(async move { commands.set_repeat_mode(mode).await });
        }
        ConsoleCommand::Autoplay { state } => {
            tokio::spawn(async move { commands.set_autoplay(state.into()).await });
        }
        ConsoleCommand::Quality { quality } => {
            tokio::spawn(async move { commands.set_audio_quality(quality).await });
        }
        ConsoleCommand::Volume { level } => {
            tokio::spawn(async move { commands.set_volume(level).await });
        }
        ConsoleCommand::Skip { index } => {
            tokio::spawn(async move { commands.skip_to_queue_index(index).await });
        }
        ConsoleCommand::Move { from, to } => {
            tokio::spawn(async move { commands.reorder_queued_item(from, to).await });
        }
        ConsoleCommand::Airplay { x, y } => {
            let anchor = x.zip(y);
            // Awaited: the answer is the point of the command.
            match commands.open_airplay_picker(anchor).await {
                Some(supported) => println!("airplay supported: {supported}"),
                None => println!("airplay: no answer from agent"),
            }
        }
        ConsoleCommand::Inspector => {
            tokio::spawn(async move { commands.open_inspector().await });
        }
        ConsoleCommand::Visible { state } => {
            let visible: bool = state.into();
            session.store().set_visible(visible);
            info!(visible, "Visibility changed");
        }
        ConsoleCommand::Status => {
            println!("{:#?}", session.store().now_playing());
            println!("{:#?}", session.store().behaviour());
        }
        ConsoleCommand::List => {
            for (index, id) in session.store().queue().ids().iter().enumerate() {
                println!("{index:>3}  {id}");
            }
        }
        ConsoleCommand::Traffic => {
            for record in session.traffic().snapshot() {
                match serde_json::to_string(&record) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("unprintable record: {e}"),
                }
            }
        }
        ConsoleCommand::Quit => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;

    use super::*;

    fn parse(line: &str) -> ConsoleCommand {
        ConsoleCommand::parse(line).unwrap()
    }

    fn error_kind(line: &str) -> ErrorKind {
        ConsoleCommand::parse(line).unwrap_err().kind()
    }

    #[test]
    fn parses_bare_verbs() {
        assert_eq!(parse("play"), ConsoleCommand::Play { shuffle: false });
        assert_eq!(parse("play --shuffle"), ConsoleCommand::Play { shuffle: true });
        assert_eq!(parse("  pause  "), ConsoleCommand::Pause);
        assert_eq!(parse("prev"), ConsoleCommand::Previous);
        assert_eq!(parse("exit"), ConsoleCommand::Quit);
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(parse("seek 95"), ConsoleCommand::Seek { seconds: 95 });
        assert_eq!(
            parse("queue album 1440"),
            ConsoleCommand::Queue {
                kind: QueueKind::Album,
                id: "1440".into()
            }
        );
        assert_eq!(parse("shuffle on"), ConsoleCommand::Shuffle { state: Switch::On });
        assert_eq!(parse("autoplay no"), ConsoleCommand::Autoplay { state: Switch::Off });
        assert_eq!(parse("repeat all"), ConsoleCommand::Repeat { mode: RepeatMode::All });
        assert_eq!(parse("repeat off"), ConsoleCommand::Repeat { mode: RepeatMode::None });
        assert_eq!(
            parse("quality 64"),
            ConsoleCommand::Quality {
                quality: AudioQuality::Standard
            }
        );
        assert_eq!(parse("volume 0.3"), ConsoleCommand::Volume { level: 0.3 });
        assert_eq!(parse("move 4 1"), ConsoleCommand::Move { from: 4, to: 1 });
        assert_eq!(parse("airplay"), ConsoleCommand::Airplay { x: None, y: None });
        assert_eq!(
            parse("airplay 10 -5"),
            ConsoleCommand::Airplay {
                x: Some(10),
                y: Some(-5)
            }
        );
        assert_eq!(parse("visible off"), ConsoleCommand::Visible { state: Switch::Off });
    }

    #[test]
    fn reports_bad_input() {
        assert_eq!(error_kind("dance"), ErrorKind::InvalidSubcommand);
        assert_eq!(error_kind("seek"), ErrorKind::MissingRequiredArgument);
        assert_eq!(error_kind("seek soon"), ErrorKind::ValueValidation);
        assert_eq!(error_kind("repeat sometimes"), ErrorKind::InvalidValue);
        assert_eq!(error_kind("queue station 1"), ErrorKind::InvalidValue);
        assert_eq!(error_kind("airplay 10"), ErrorKind::MissingRequiredArgument);
        assert_eq!(error_kind("pause now"), ErrorKind::UnknownArgument);
    }

    #[test]
    fn help_is_generated_from_the_commands() {
        assert_eq!(error_kind("help"), ErrorKind::DisplayHelp);
        assert_eq!(error_kind("help seek"), ErrorKind::DisplayHelp);

        let text = help();
        for verb in ["play", "seek", "queue", "airplay", "traffic", "quit"] {
            assert!(text.contains(verb), "help is missing {verb}:\n{text}");
        }
    }

    #[tokio::test]
    async fn reader_skips_blank_lines_and_keeps_going_after_errors() {
        let input = tokio_test::io::Builder::new()
            .read(b"play\n\n   \nseek ")
            .read(b"soon\nvolume 0.5\n")
            .build();
        let mut reader = CommandReader::new(tokio::io::BufReader::new(input));

        assert_eq!(
            reader.next_command().await.unwrap().unwrap().unwrap(),
            ConsoleCommand::Play { shuffle: false }
        );
        let err = reader.next_command().await.unwrap().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
        assert_eq!(
            reader.next_command().await.unwrap().unwrap().unwrap(),
            ConsoleCommand::Volume { level: 0.5 }
        );
        assert!(reader.next_command().await.unwrap().is_none());
    }
}
