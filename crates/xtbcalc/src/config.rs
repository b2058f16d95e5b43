//! Configuration settings for an xtb calculator

use std::{
    fmt::{Debug, Display},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{error::ProgramError, xcontrol::XControl};


/// The base command can be written either as a single string, which is split
/// on whitespace, or as a list of tokens
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(untagged)]
enum CmdSrc {
    Line(String),
    Tokens(Vec<String>),
}

impl From<CmdSrc> for Vec<String> {
    fn from(value: CmdSrc) -> Self {
        match value {
            CmdSrc::Line(s) => {
                s.split_whitespace().map(str::to_owned).collect()
            }
            CmdSrc::Tokens(v) => v,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(untagged)]
enum GfnSrc {
    Level(i64),
    Name(String),
}

/// The Hamiltonian used by xtb
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "GfnSrc", into = "GfnSrc")]
pub enum Gfn {
    Gfn0,
    Gfn1,
    #[default]
    Gfn2,
    /// the GFN-FF force field
    Ff,
}

impl TryFrom<GfnSrc> for Gfn {
    type Error = ProgramError;

    fn try_from(value: GfnSrc) -> Result<Self, Self::Error> {
        match value {
            GfnSrc::Level(0) => Ok(Gfn::Gfn0),
            GfnSrc::Level(1) => Ok(Gfn::Gfn1),
            GfnSrc::Level(2) => Ok(Gfn::Gfn2),
            GfnSrc::Name(s) if s.eq_ignore_ascii_case("ff") => Ok(Gfn::Ff),
            GfnSrc::Level(i) => Err(ProgramError::InvalidGfn(i.to_string())),
            GfnSrc::Name(s) => Err(ProgramError::InvalidGfn(s)),
        }
    }
}

impl From<Gfn> for GfnSrc {
    fn from(value: Gfn) -> Self {
        match value {
            Gfn::Gfn0 => GfnSrc::Level(0),
            Gfn::Gfn1 => GfnSrc::Level(1),
            Gfn::Gfn2 => GfnSrc::Level(2),
            Gfn::Ff => GfnSrc::Name("ff".to_owned()),
        }
    }
}

impl Display for Gfn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gfn::Gfn0 => write!(f, "0"),
            Gfn::Gfn1 => write!(f, "1"),
            Gfn::Gfn2 => write!(f, "2"),
            Gfn::Ff => write!(f, "ff"),
        }
    }
}

impl Gfn {
    /// the command-line flags selecting this Hamiltonian
    pub fn args(&self) -> Vec<String> {
        match self {
            Gfn::Ff => crate::string!["--gfnff"],
            level => crate::string!["--gfn", level.to_string()],
        }
    }
}

#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    /// The molecular charge, passed to xtb with --chrg.
    charge: Option<isize>,

    /// The spin multiplicity. xtb is given the number of unpaired electrons,
    /// mult - 1, with --uhf.
    mult: Option<usize>,

    /// The number of threads xtb may use, exported as OMP_NUM_THREADS and
    /// MKL_NUM_THREADS.
    pal: Option<usize>,

    /// Memory per thread in MB, exported as OMP_STACKSIZE.
    mem: Option<usize>,

    /// The command used to run xtb. If absent, the XTB_CMD environment variable
    /// is consulted before falling back to plain `xtb`.
    cmd: Option<CmdSrc>,

    /// The directory where retained output files are copied.
    out_dir: Option<PathBuf>,

    /// The prefix for retained output files.
    base_name: Option<String>,

    /// The directory in which the temporary working directories are created.
    scratch_dir: Option<PathBuf>,

    /// Solvent for the GBSA implicit solvation model.
    gbsa: Option<String>,

    /// Solvent for the ALPB implicit solvation model. Ignored if gbsa is also
    /// given.
    alpb: Option<String>,

    /// The Hamiltonian, one of 0, 1, 2, or "ff".
    gfn: Option<Gfn>,

    /// Accuracy of the calculation. Lower values select tighter thresholds.
    acc: Option<f64>,

    /// The maximum number of SCC iterations.
    iterations: Option<usize>,

    /// The electronic temperature in K.
    etemp: Option<f64>,

    /// The electronic temperature in K to use when retrying a failed
    /// calculation. Not compatible with etemp.
    retry_etemp: Option<f64>,

    /// Retain the xtbrestart file and start later calculations from it.
    restart: Option<bool>,

    /// Additional sections for the xcontrol file. These replace any section of
    /// the same name generated by the calculator.
    xtb_options: Option<XControl>,

    /// A GFN-FF topology file to reuse across calculations.
    topo: Option<PathBuf>,

    /// Regenerate the topology every topo_update calculations.
    topo_update: Option<usize>,

    /// Don't retain any output files.
    quiet: Option<bool>,
}

/// Construct a full `Config` using [Config::load] on a TOML file or use
/// [Config::new] and the builder methods
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
#[serde(try_from = "RawConfig")]
pub struct Config {
    /// total molecular charge
    pub charge: isize,

    /// spin multiplicity
    pub mult: usize,

    /// number of threads for xtb
    pub pal: usize,

    /// memory per thread in MB
    pub mem: usize,

    /// base command, split into tokens. empty means look it up in the
    /// environment when the calculator is built
    pub cmd: Vec<String>,

    pub out_dir: PathBuf,

    pub base_name: String,

    /// parent of the temporary working directories. `None` means the system
    /// temporary directory
    pub scratch_dir: Option<PathBuf>,

    pub gbsa: Option<String>,

    pub alpb: Option<String>,

    pub gfn: Gfn,

    pub acc: f64,

    pub iterations: usize,

    pub etemp: Option<f64>,

    pub retry_etemp: Option<f64>,

    pub restart: bool,

    pub xtb_options: XControl,

    pub topo: Option<PathBuf>,

    pub topo_update: Option<usize>,

    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = ProgramError;

    fn try_from(rc: RawConfig) -> Result<Self, Self::Error> {
        let ret = Self {
            charge: rc.charge.unwrap_or(0),
            mult: rc.mult.unwrap_or(1),
            pal: rc.pal.unwrap_or(1),
            mem: rc.mem.unwrap_or(1000),
            cmd: rc.cmd.map(Vec::from).unwrap_or_default(),
            out_dir: rc.out_dir.unwrap_or_else(|| PathBuf::from(".")),
            base_name: rc
                .base_name
                .unwrap_or_else(|| "calculator".to_owned()),
            scratch_dir: rc.scratch_dir,
            gbsa: rc.gbsa,
            alpb: rc.alpb,
            gfn: rc.gfn.unwrap_or_default(),
            acc: rc.acc.unwrap_or(1.0),
            iterations: rc.iterations.unwrap_or(250),
            etemp: rc.etemp,
            retry_etemp: rc.retry_etemp,
            restart: rc.restart.unwrap_or(false),
            xtb_options: rc.xtb_options.unwrap_or_default(),
            topo: rc.topo,
            topo_update: rc.topo_update,
            quiet: rc.quiet.unwrap_or(false),
        };
        ret.validate()?;
        Ok(ret)
    }
}

macro_rules! builders {
    ($($name:ident: $t:ty),* $(,)?) => {
        $(pub fn $name(mut self, v: $t) -> Self {
            self.$name = v;
            self
        })*
    }
}

macro_rules! option_builders {
    ($($name:ident: $t:ty),* $(,)?) => {
        $(pub fn $name(mut self, v: impl Into<$t>) -> Self {
            self.$name = Some(v.into());
            self
        })*
    }
}

impl Config {
    /// Construct a [Config] with a neutral singlet, one thread with 1000 MB,
    /// GFN2, `acc` 1.0, 250 SCC iterations, no solvent model, and files
    /// retained in the current directory with the prefix `calculator`
    pub fn new() -> Self {
        Self {
            charge: 0,
            mult: 1,
            pal: 1,
            mem: 1000,
            cmd: Vec::new(),
            out_dir: PathBuf::from("."),
            base_name: "calculator".to_owned(),
            scratch_dir: None,
            gbsa: None,
            alpb: None,
            gfn: Gfn::default(),
            acc: 1.0,
            iterations: 250,
            etemp: None,
            retry_etemp: None,
            restart: false,
            xtb_options: XControl::default(),
            topo: None,
            topo_update: None,
            quiet: false,
        }
    }

    builders!(
        charge: isize,
        mult: usize,
        pal: usize,
        mem: usize,
        cmd: Vec<String>,
        out_dir: PathBuf,
        base_name: String,
        gfn: Gfn,
        acc: f64,
        iterations: usize,
        restart: bool,
        xtb_options: XControl,
        quiet: bool,
    );

    option_builders!(
        scratch_dir: PathBuf,
        gbsa: String,
        alpb: String,
        etemp: f64,
        retry_etemp: f64,
        topo: PathBuf,
        topo_update: usize,
    );

    /// load a [Config] from the TOML file specified by `filename`
    pub fn load<P>(filename: P) -> Result<Self, ProgramError>
    where
        P: AsRef<Path> + Debug,
    {
        let contents = std::fs::read_to_string(&filename)
            .map_err(|e| ProgramError::read(&filename, e))?;
        toml::from_str(&contents).map_err(|e| {
            ProgramError::Config(format!(
                "failed to deserialize config file '{filename:?}' with {e}"
            ))
        })
    }

    /// check that the settings in `self` make sense together
    pub fn validate(&self) -> Result<(), ProgramError> {
        if self.etemp.is_some() && self.retry_etemp.is_some() {
            return Err(ProgramError::IncompatibleEtemp);
        }
        if self.mult == 0 {
            return Err(ProgramError::InvalidMultiplicity(self.mult));
        }
        Ok(())
    }

    /// the number of unpaired electrons
    pub fn uhf(&self) -> usize {
        self.mult.saturating_sub(1)
    }

    /// the command for running xtb: `cmd` if it was set, otherwise the
    /// contents of `XTB_CMD`, otherwise `xtb`
    pub fn base_cmd(&self) -> Vec<String> {
        if !self.cmd.is_empty() {
            return self.cmd.clone();
        }
        match std::env::var("XTB_CMD") {
            Ok(s) if !s.trim().is_empty() => {
                s.split_whitespace().map(str::to_owned).collect()
            }
            _ => crate::string!["xtb"],
        }
    }
}
