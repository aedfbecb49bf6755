use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::model::{Frequency, HabitFrequency};

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "cadence",
    version,
    about = "Cadence: daily steps, habits and milestones from the terminal",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append,
        global = true
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "rc-file", global = true)]
    pub rc_file: Option<PathBuf>,

    #[arg(long = "data", global = true)]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Add a step.
    Add(AddArgs),

    /// Complete a step. Recurring steps move to their next occurrence.
    Done {
        id: String,

        /// Completion date; defaults to today.
        #[arg(long)]
        on: Option<String>,
    },

    /// Delete a step.
    Delete { id: String },

    /// Change a step.
    Edit(EditArgs),

    /// Overdue steps and everything due today.
    Today,

    /// Overdue steps and the month ahead.
    Upcoming {
        /// How many pages of the feed to show.
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },

    #[command(subcommand)]
    Habit(HabitCommand),

    #[command(subcommand)]
    Milestone(MilestoneCommand),

    #[command(subcommand)]
    Area(AreaCommand),
}

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    #[arg(required = true, num_args = 1..)]
    pub title: Vec<String>,

    /// YYYY-MM-DD, today, tomorrow or yesterday.
    #[arg(long)]
    pub date: Option<String>,

    #[arg(long)]
    pub important: bool,

    #[arg(long)]
    pub urgent: bool,

    #[arg(long)]
    pub area: Option<String>,

    #[arg(long)]
    pub goal: Option<String>,

    #[arg(long, value_enum)]
    pub repeat: Option<RepeatArg>,

    #[arg(long, default_value_t = 1, requires = "repeat")]
    pub every: u32,

    /// Comma separated weekdays for weekly repeats.
    #[arg(long, value_delimiter = ',', requires = "repeat")]
    pub days: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct EditArgs {
    pub id: String,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long, conflicts_with = "clear_date")]
    pub date: Option<String>,

    #[arg(long)]
    pub clear_date: bool,

    #[arg(long)]
    pub important: Option<bool>,

    #[arg(long)]
    pub urgent: Option<bool>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum HabitCommand {
    Add {
        #[arg(required = true, num_args = 1..)]
        name: Vec<String>,

        #[arg(long, value_enum, default_value_t = HabitFrequencyArg::Daily)]
        frequency: HabitFrequencyArg,

        #[arg(long, value_delimiter = ',')]
        days: Vec<String>,

        #[arg(long)]
        area: Option<String>,

        /// HH:MM
        #[arg(long)]
        reminder: Option<String>,
    },

    Check {
        id: String,

        #[arg(long)]
        on: Option<String>,
    },

    /// Habits scheduled for a day, with streaks.
    List {
        #[arg(long)]
        on: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum MilestoneCommand {
    Add {
        area: String,

        #[arg(required = true, num_args = 1..)]
        title: Vec<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        progress: i32,
    },

    Progress {
        id: String,

        #[arg(allow_negative_numbers = true)]
        percent: i32,
    },

    Complete { id: String },

    List {
        #[arg(long)]
        area: Option<String>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum AreaCommand {
    Add {
        #[arg(required = true, num_args = 1..)]
        name: Vec<String>,

        #[arg(long, default_value = "")]
        color: String,

        #[arg(long, default_value = "")]
        icon: String,
    },

    List,

    Delete {
        id: String,

        /// Delete the area's steps, habits and milestones too.
        #[arg(long)]
        with_related: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatArg {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl From<RepeatArg> for Frequency {
    fn from(arg: RepeatArg) -> Self {
        match arg {
            RepeatArg::Daily => Self::Daily,
            RepeatArg::Weekly => Self::Weekly,
            RepeatArg::Monthly => Self::Monthly,
            RepeatArg::Yearly => Self::Yearly,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HabitFrequencyArg {
    Daily,
    Weekly,
    Custom,
}

impl From<HabitFrequencyArg> for HabitFrequency {
    fn from(arg: HabitFrequencyArg) -> Self {
        match arg {
            HabitFrequencyArg::Daily => Self::Daily,
            HabitFrequencyArg::Weekly => Self::Weekly,
            HabitFrequencyArg::Custom => Self::Custom,
        }
    }
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls bare `rc.key=value` (or `rc.key:value`) arguments out of the
/// command line so they can sit anywhere, ahead of clap parsing.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> PreprocessedArgs {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.")
            && let Some((k, v)) = rest.split_once('=').or_else(|| rest.split_once(':'))
        {
            debug!(key = %k, value = %v, "captured positional rc override");
            overrides.push((format!("rc.{k}"), v.to_string()));
            continue;
        }

        cleaned.push(arg);
    }

    PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;

    use super::{Command, GlobalCli, HabitCommand, preprocess_args};

    fn args(raw: &[&str]) -> Vec<OsString> {
        raw.iter().map(OsString::from).collect()
    }

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let pre = preprocess_args(&args(&["cadence", "rc.feed.step=5", "today", "rc.color:off"]));
        assert_eq!(pre.cleaned_args, args(&["cadence", "today"]));
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.feed.step".to_string(), "5".to_string()),
                ("rc.color".to_string(), "off".to_string()),
            ]
        );
    }

    #[test]
    fn parses_nested_subcommands() {
        let cli = GlobalCli::try_parse_from(["cadence", "-vv", "habit", "check", "h1", "--on", "tomorrow"])
            .expect("valid command line");
        assert_eq!(cli.verbose, 2);
        let Some(Command::Habit(HabitCommand::Check { id, on })) = cli.command else {
            panic!("unexpected command: {:?}", cli.command);
        };
        assert_eq!(id, "h1");
        assert_eq!(on.as_deref(), Some("tomorrow"));
    }

    #[test]
    fn days_require_repeat() {
        assert!(GlobalCli::try_parse_from(["cadence", "add", "gym", "--days", "monday"]).is_err());
        assert!(
            GlobalCli::try_parse_from(["cadence", "add", "gym", "--repeat", "weekly", "--days", "monday,friday"])
                .is_ok()
        );
    }
}
