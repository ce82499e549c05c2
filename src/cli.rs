//! Command line interface

use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Drive a Vivado Tcl shell over TCP
#[derive(Parser, Debug)]
#[command(name = "vivado-remote")]
#[command(about = "Run Vivado behind a session server and drive it remotely")]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: ~/.vivado-remote/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g. "debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start Vivado and serve its shell on a TCP port
    Serve(ServeArgs),
    /// Synthesize design
    Synth(SynthArgs),
    /// Place design
    Place(TransformArgs),
    /// Route design
    Route(TransformArgs),
    /// Write bitstream
    Bitstream(BitstreamArgs),
    /// Write config memory file
    #[command(name = "cfg_mem")]
    CfgMem(CfgMemArgs),
    /// Load bitstream
    Load(LoadArgs),
    /// Flash bitstream to configuration memory
    Flash(FlashArgs),
    /// Run design checks
    Check(LoadArgs),
}

impl Commands {
    /// Options shared by every client sub-command
    pub fn common(&self) -> Option<&CommonArgs> {
        match self {
            Self::Serve(_) => None,
            Self::Synth(a) => Some(&a.common),
            Self::Place(a) | Self::Route(a) => Some(&a.common),
            Self::Bitstream(a) => Some(&a.transform.common),
            Self::CfgMem(a) => Some(&a.transform.common),
            Self::Load(a) | Self::Check(a) => Some(&a.common),
            Self::Flash(a) => Some(&a.load.common),
        }
    }

    /// File the sub-command produces, removed again if it fails
    pub fn output(&self) -> Option<&Path> {
        match self {
            Self::Synth(a) => Some(&a.output),
            Self::Place(a) | Self::Route(a) => Some(&a.output),
            Self::Bitstream(a) => Some(&a.transform.output),
            Self::CfgMem(a) => Some(&a.transform.output),
            Self::Serve(_) | Self::Load(_) | Self::Flash(_) | Self::Check(_) => None,
        }
        .map(PathBuf::as_path)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Serve(_) => "serve",
            Self::Synth(_) => "synth",
            Self::Place(_) => "place",
            Self::Route(_) => "route",
            Self::Bitstream(_) => "bitstream",
            Self::CfgMem(_) => "cfg_mem",
            Self::Load(_) => "load",
            Self::Flash(_) => "flash",
            Self::Check(_) => "check",
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to Vivado executable
    #[arg(long = "exec_path", alias = "exec-path")]
    pub exec_path: Option<String>,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Keep the operator terminal in cooked mode
    #[arg(long)]
    pub no_raw: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Part number
    #[arg(short, long)]
    pub part: String,

    /// Constraint file(s)
    #[arg(short, long, num_args = 1..)]
    pub constraint: Vec<String>,

    /// Tcl script(s) to run
    #[arg(long, num_args = 1..)]
    pub tcl: Vec<String>,

    /// Display all output, not just errors
    #[arg(long)]
    pub verbose: bool,

    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Give up on a command after this many idle seconds
    #[arg(long, env = "VIVADO_REMOTE_TIMEOUT")]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct SynthArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Output checkpoint
    #[arg(short, long)]
    pub output: PathBuf,

    /// Verilog / SystemVerilog source(s)
    #[arg(short, long, num_args = 1.., required = true)]
    pub verilog: Vec<String>,

    /// Top level module name
    #[arg(short, long)]
    pub top: String,
}

/// Checkpoint in, file out
#[derive(Args, Debug)]
pub struct TransformArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Input file
    #[arg(short, long)]
    pub input: String,

    /// Output file
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct BitstreamArgs {
    #[command(flatten)]
    pub transform: TransformArgs,

    /// Perform design checks after writing the bitstream
    #[arg(long)]
    pub check: bool,
}

#[derive(Args, Debug)]
pub struct CfgMemArgs {
    #[command(flatten)]
    pub transform: TransformArgs,

    /// Memory size [MB]
    #[arg(long)]
    pub size: u32,

    /// Configuration interface
    #[arg(long, value_enum)]
    pub interface: MemoryInterface,
}

/// Input only
#[derive(Args, Debug)]
pub struct LoadArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Input file
    #[arg(short, long)]
    pub input: String,
}

#[derive(Args, Debug)]
pub struct FlashArgs {
    #[command(flatten)]
    pub load: LoadArgs,

    /// Vivado memory part number
    #[arg(long)]
    pub memory: String,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryInterface {
    #[value(name = "SMAPx8")]
    Smapx8,
    #[value(name = "SMAPx16")]
    Smapx16,
    #[value(name = "SMAPx32")]
    Smapx32,
    #[value(name = "SERIALx1")]
    Serialx1,
    #[value(name = "SPIx1")]
    Spix1,
    #[value(name = "SPIx2")]
    Spix2,
    #[value(name = "SPIx4")]
    Spix4,
    #[value(name = "SPIx8")]
    Spix8,
    #[value(name = "BPIx8")]
    Bpix8,
    #[value(name = "BPIx16")]
    Bpix16,
}

impl fmt::Display for MemoryInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => f.write_str(value.get_name()),
            None => Ok(()),
        }
    }
}
