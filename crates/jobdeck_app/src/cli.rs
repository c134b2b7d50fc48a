use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use jobdeck_core::{JobKind, JobMode};

#[derive(Parser, Debug)]
#[command(name = "jobdeck", version, about = "Drive batch jobs, bulk replies and the browser VM")]
pub struct Cli {
    /// RON settings file; defaults apply when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Use the built-in simulator even when a backend is configured.
    #[arg(long, global = true)]
    pub demo: bool,
    /// Overrides the configured log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a job, start it and follow it to a terminal state.
    Run(RunArgs),
    /// Reply to messages over the bulk stream. Ctrl-C cancels.
    BulkReply(BulkReplyArgs),
    /// Inspect or control the browser VM.
    Vm(VmArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(long, value_enum)]
    pub kind: KindArg,
    #[arg(long, value_enum, default_value_t = ModeArg::Headless)]
    pub mode: ModeArg,
    /// Item identifier; repeat for each item.
    #[arg(long = "item", required = true)]
    pub items: Vec<String>,
}

#[derive(Args, Debug)]
pub struct BulkReplyArgs {
    #[arg(required = true)]
    pub message_ids: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VmArgs {
    #[command(subcommand)]
    pub cmd: VmCmd,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCmd {
    /// Print the current VM status.
    Status,
    /// Start the VM and wait until it runs or times out.
    Start,
    /// Stop the VM and wait until it is stopped.
    Stop,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    PassCheck,
    ReturnToOrigin,
    Return,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::PassCheck => JobKind::PassCheck,
            KindArg::ReturnToOrigin => JobKind::ReturnToOrigin,
            KindArg::Return => JobKind::Return,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    /// Steps run in a remote browser session the user can watch.
    Interactive,
    /// Steps run against the upstream API.
    Headless,
}

impl From<ModeArg> for JobMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Interactive => JobMode::InteractiveBrowser,
            ModeArg::Headless => JobMode::HeadlessApi,
        }
    }
}
