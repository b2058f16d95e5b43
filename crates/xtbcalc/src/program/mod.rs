//! The xtb calculator. Each calculation stages its input in a fresh working
//! directory, runs xtb there through a [Runner], and hands the directory to
//! the parser for its [Calc] mode.

use std::{
    collections::BTreeMap,
    fs::{copy, create_dir_all, write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::{
    config::Config,
    error::ProgramError,
    geom::{Geom, load_trajectory, xyz_string},
    pointcharges::{PC_HARDNESS, PointCharge, write_pc_file},
    runner::{Invocation, Local, Runner},
    string,
    xcontrol::{Value, XControl},
};

use parse::{
    mdrestart_string, parse_energy_file, parse_gradient, parse_hessian,
};
pub use parse::{TextSource, check_termination};

pub mod parse;

#[cfg(test)]
mod tests;

/// the coordinate file passed to xtb
pub const INP_FN: &str = "xtb.xyz";

/// the file receiving xtb's standard output
pub const OUT_FN: &str = "xtb.out";

pub const XCONTROL_FN: &str = "xcontrol";

pub const TOPO_FN: &str = "gfnff_topo";

pub const PC_FN: &str = "pointcharges_inp.pc";

pub const MDRESTART_FN: &str = "mdrestart";

/// files copied out of the working directory after every calculation, unless
/// the calculator is quiet
pub const TO_KEEP: [&str; 8] = [
    OUT_FN,
    "gradient",
    "xtbopt.xyz",
    "g98.out",
    "xtb.trj",
    "charges",
    XCONTROL_FN,
    "xtbout.json",
];

/// The kind of calculation, selecting how the output directory is parsed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Calc {
    /// read only the total energy from the output log
    Energy,
    Grad,
    Hess,
    Opt {
        /// also load the full optimization trajectory
        keep_log: bool,
    },
    Md,
    Topo,
    NoParse,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Forces {
    pub energy: f64,

    /// the negative gradient in Eh/bohr, flattened over atoms
    pub forces: DVector<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hessian {
    pub energy: f64,
    pub hessian: DMatrix<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptResult {
    /// the final geometry, carrying its energy
    pub opt_geom: Geom,
    pub opt_log: Option<Vec<Geom>>,
}

/// The parsed output of one calculation, one variant per [Calc]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CalcResult {
    Energy(f64),
    Forces(Forces),
    Hessian(Hessian),
    /// `None` when the optimization did not converge
    Opt(Option<OptResult>),
    Md(Vec<Geom>),
    Topo(PathBuf),
    None,
}

macro_rules! into_variant {
    ($($name:ident => $variant:ident($t:ty)),* $(,)?) => {
        $(pub fn $name(self) -> Result<$t, ProgramError> {
            match self {
                Self::$variant(v) => Ok(v),
                other => Err(ProgramError::UnexpectedResult(format!(
                    "expected {}, got {other:?}",
                    stringify!($variant)
                ))),
            }
        })*
    };
}

impl CalcResult {
    into_variant! {
        into_energy => Energy(f64),
        into_forces => Forces(Forces),
        into_hessian => Hessian(Hessian),
        into_opt => Opt(Option<OptResult>),
        into_md => Md(Vec<Geom>),
        into_topo => Topo(PathBuf),
    }
}

/// An xtb calculator. Calculations take `&mut self` because the topology and
/// restart files carry over from one calculation to the next, so a single
/// calculator runs one calculation at a time
#[derive(Debug)]
pub struct Xtb<R: Runner = Local> {
    config: Config,
    runner: R,
    base_cmd: Vec<String>,

    /// the topology file copied into each working directory
    topo: Option<PathBuf>,

    /// the number of calculations that have used `topo`
    topo_used: usize,

    xtbrestart: Option<PathBuf>,

    /// the most recently retained `charges` file
    charges: Option<PathBuf>,

    /// the most recently retained `xtbout.json` file
    json: Option<PathBuf>,

    calc_number: usize,
}

impl Xtb<Local> {
    pub fn new(config: Config) -> Result<Self, ProgramError> {
        Self::with_runner(config, Local)
    }
}

impl<R: Runner> Xtb<R> {
    /// construct an [Xtb] that carries out its calculations with `runner`
    pub fn with_runner(config: Config, runner: R) -> Result<Self, ProgramError> {
        config.validate()?;
        let base_cmd = config.base_cmd();
        Ok(Self {
            topo: config.topo.clone(),
            topo_used: 0,
            xtbrestart: None,
            charges: None,
            json: None,
            calc_number: 0,
            base_cmd,
            runner,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn base_cmd(&self) -> &[String] {
        &self.base_cmd
    }

    /// the number of the next calculation
    pub fn calc_number(&self) -> usize {
        self.calc_number
    }

    pub fn topo(&self) -> Option<&Path> {
        self.topo.as_deref()
    }

    pub fn topo_used(&self) -> usize {
        self.topo_used
    }

    pub fn xtbrestart(&self) -> Option<&Path> {
        self.xtbrestart.as_deref()
    }

    /// use the xtbrestart file at `path` for the following calculations
    pub fn set_xtbrestart(&mut self, path: impl Into<PathBuf>) {
        self.xtbrestart = Some(path.into());
    }

    /// a fresh working directory in `scratch_dir`, removed when dropped
    fn prepare_path(&self) -> Result<TempDir, ProgramError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("xtb_");
        let dir = match &self.config.scratch_dir {
            Some(scratch) => {
                create_dir_all(scratch)
                    .map_err(|e| ProgramError::write(scratch, e))?;
                builder.tempdir_in(scratch)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| {
            let parent = self
                .config
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            ProgramError::write(parent, e)
        })
    }

    /// the path where the file `name` from the current calculation is retained
    pub fn make_fn(&self, name: &str) -> PathBuf {
        self.config.out_dir.join(format!(
            "{}.{:03}.{name}",
            self.config.base_name, self.calc_number
        ))
    }

    pub fn prepare_coords(
        &self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
    ) -> String {
        xyz_string(atoms, coords, "")
    }

    /// Write the xcontrol file, point charges, topology, and restart file for
    /// a calculation into `dir`. `base` holds sections specific to the
    /// calculation, and both it and the point-charge embedding are overridden
    /// by matching sections in the configured `xtb_options`.
    fn prepare_input(
        &mut self,
        dir: &Path,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        point_charges: Option<&[PointCharge]>,
        base: &XControl,
    ) -> Result<(), ProgramError> {
        let mut xcontrol = XControl::new().with("write", "json", true);
        xcontrol.update(base);
        if let Some(pcs) = point_charges {
            write_pc_file(pcs, dir.join(PC_FN), Some(PC_HARDNESS))?;
            xcontrol
                .set("embedding", "input", PC_FN)
                .set("embedding", "interface", "orca");
        }
        xcontrol.update(&self.config.xtb_options);
        let path = dir.join(XCONTROL_FN);
        write(&path, xcontrol.render())
            .map_err(|e| ProgramError::write(&path, e))?;

        // refresh before copying so a new topology is used right away
        if let Some(n) = self.config.topo_update
            && self.topo_used > 0
            && n > 0
            && self.topo_used % n == 0
        {
            let topo = self.run_topo(atoms, coords)?;
            info!("updated topology, saved to '{}'", topo.display());
            self.topo = Some(topo);
        }
        if let Some(topo) = &self.topo {
            copy(topo, dir.join(TOPO_FN))
                .map_err(|e| ProgramError::read(topo, e))?;
            info!("using topology given in '{}'", topo.display());
            self.topo_used += 1;
        }
        if let Some(restart) = &self.xtbrestart {
            copy(restart, dir.join("xtbrestart"))
                .map_err(|e| ProgramError::read(restart, e))?;
            info!("using xtbrestart given in '{}'", restart.display());
        }
        Ok(())
    }

    /// the arguments shared by every calculation
    pub fn add_args(&self) -> Vec<String> {
        let c = &self.config;
        let mut args = string![
            "--input",
            XCONTROL_FN,
            "--chrg",
            c.charge.to_string(),
            "--uhf",
            c.uhf().to_string(),
            "--acc",
            Value::Float(c.acc).to_string(),
            "--iterations",
            c.iterations.to_string(),
        ];
        if let Some(etemp) = c.etemp {
            args.extend(string!["--etemp", Value::Float(etemp).to_string()]);
        }
        let nonempty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
        if let Some(gbsa) = nonempty(&c.gbsa) {
            args.extend(string!["--gbsa", gbsa]);
        } else if let Some(alpb) = nonempty(&c.alpb) {
            args.extend(string!["--alpb", alpb]);
        }
        args.extend(c.gfn.args());
        args
    }

    /// the environment variables controlling xtb's threads and stack size
    pub fn pal_env(&self) -> BTreeMap<String, String> {
        let pal = self.config.pal.to_string();
        BTreeMap::from([
            ("OMP_NUM_THREADS".to_owned(), pal.clone()),
            ("MKL_NUM_THREADS".to_owned(), pal),
            ("OMP_STACKSIZE".to_owned(), format!("{}M", self.config.mem)),
        ])
    }

    /// Write the coordinates, run `cmd` (or the base command) in `dir`, and
    /// parse the results according to `calc`. Unless `keep` is false or the
    /// calculator is quiet, the output files are then retained in `out_dir`.
    #[allow(clippy::too_many_arguments)]
    fn run(
        &mut self,
        dir: &TempDir,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        calc: Calc,
        cmd: Option<Vec<String>>,
        args: Vec<String>,
        keep: bool,
    ) -> Result<CalcResult, ProgramError> {
        let path = dir.path().join(INP_FN);
        write(&path, self.prepare_coords(atoms, coords))
            .map_err(|e| ProgramError::write(&path, e))?;
        let inv = Invocation {
            cmd: cmd.unwrap_or_else(|| self.base_cmd.clone()),
            args,
            env: self.pal_env(),
            dir: dir.path().to_owned(),
            inp_fn: INP_FN.to_owned(),
            out_fn: OUT_FN.to_owned(),
        };
        info!("executing {}", inv.argv().join(" "));
        self.runner.run(&inv)?;
        let res = self.parse(calc, dir.path())?;
        if keep {
            self.keep(dir.path())?;
        }
        self.calc_number += 1;
        Ok(res)
    }

    fn parse(&self, calc: Calc, dir: &Path) -> Result<CalcResult, ProgramError> {
        Ok(match calc {
            Calc::Energy => {
                CalcResult::Energy(parse_energy_file(&dir.join(OUT_FN))?)
            }
            Calc::Grad => {
                CalcResult::Forces(parse_gradient(&dir.join("gradient"))?)
            }
            Calc::Hess => CalcResult::Hessian(parse_hessian(dir, OUT_FN)?),
            Calc::Opt { keep_log } => {
                CalcResult::Opt(self.parse_opt(dir, keep_log)?)
            }
            Calc::Md => CalcResult::Md(self.parse_md(dir)?),
            Calc::Topo => CalcResult::Topo(self.parse_topo(dir)?),
            Calc::NoParse => CalcResult::None,
        })
    }

    /// copy `src` to its retained location for the current calculation
    fn persist(&self, src: &Path, name: &str) -> Result<PathBuf, ProgramError> {
        let dest = self.make_fn(name);
        if let Some(parent) = dest.parent() {
            create_dir_all(parent)
                .map_err(|e| ProgramError::write(parent, e))?;
        }
        copy(src, &dest).map_err(|e| ProgramError::write(&dest, e))?;
        debug!("kept {} as {}", src.display(), dest.display());
        Ok(dest)
    }

    /// retain the files in [TO_KEEP] found in `dir`, plus the xtbrestart file
    /// when restarting is enabled
    fn keep(&mut self, dir: &Path) -> Result<(), ProgramError> {
        if self.config.quiet {
            return Ok(());
        }
        let restart = self.config.restart.then_some("xtbrestart");
        for name in TO_KEEP.into_iter().chain(restart) {
            let src = dir.join(name);
            if !src.is_file() {
                continue;
            }
            let dest = self.persist(&src, name)?;
            match name {
                "charges" => self.charges = Some(dest),
                "xtbout.json" => self.json = Some(dest),
                "xtbrestart" => self.xtbrestart = Some(dest),
                _ => {}
            }
        }
        Ok(())
    }

    /// Run a single calculation of type `calc` and return its parsed result.
    /// [Calc::Energy] and [Calc::NoParse] run a plain single point. Use
    /// [Xtb::run_md] for dynamics, which needs a time and step.
    pub fn calculate(
        &mut self,
        calc: Calc,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        point_charges: Option<&[PointCharge]>,
    ) -> Result<CalcResult, ProgramError> {
        let extra = match calc {
            Calc::Energy | Calc::NoParse => Vec::new(),
            Calc::Grad => string!["--grad"],
            Calc::Hess => string!["--hess"],
            Calc::Opt { .. } => string!["--opt", "tight"],
            Calc::Topo => {
                return self.run_topo(atoms, coords).map(CalcResult::Topo);
            }
            Calc::Md => {
                return Err(ProgramError::UnexpectedResult(
                    "md calculations need a time and step".to_owned(),
                ));
            }
        };
        let dir = self.prepare_path()?;
        self.prepare_input(
            dir.path(),
            atoms,
            coords,
            point_charges,
            &XControl::new(),
        )?;
        let mut args = self.add_args();
        args.extend(extra);
        self.run(&dir, atoms, coords, calc, None, args, true)
    }

    /// the energy and forces of `coords`, in bohr, optionally embedded in
    /// `point_charges`
    pub fn get_forces(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        point_charges: Option<&[PointCharge]>,
    ) -> Result<Forces, ProgramError> {
        self.calculate(Calc::Grad, atoms, coords, point_charges)?
            .into_forces()
    }

    /// the energy from a gradient calculation, dropping the forces
    pub fn get_energy(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        point_charges: Option<&[PointCharge]>,
    ) -> Result<f64, ProgramError> {
        Ok(self.get_forces(atoms, coords, point_charges)?.energy)
    }

    /// the same as [Xtb::get_energy]
    pub fn run_calculation(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        point_charges: Option<&[PointCharge]>,
    ) -> Result<f64, ProgramError> {
        self.get_energy(atoms, coords, point_charges)
    }

    pub fn get_hessian(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        point_charges: Option<&[PointCharge]>,
    ) -> Result<Hessian, ProgramError> {
        self.calculate(Calc::Hess, atoms, coords, point_charges)?
            .into_hessian()
    }

    /// Optimize `coords` with xtb's own optimizer. `Ok(None)` means the
    /// optimization did not converge. `keep` controls file retention, and
    /// `keep_log` loads every step of the optimization into the result.
    pub fn run_opt(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        keep: bool,
        keep_log: bool,
    ) -> Result<Option<OptResult>, ProgramError> {
        let dir = self.prepare_path()?;
        self.prepare_input(dir.path(), atoms, coords, None, &XControl::new())?;
        let mut args = self.add_args();
        args.extend(string!["--opt", "tight"]);
        self.run(&dir, atoms, coords, Calc::Opt { keep_log }, None, args, keep)?
            .into_opt()
    }

    fn parse_opt(
        &self,
        dir: &Path,
        keep_log: bool,
    ) -> Result<Option<OptResult>, ProgramError> {
        let xtbopt = dir.join("xtbopt.xyz");
        if !xtbopt.is_file() {
            warn!("{:03} failed", self.calc_number);
            return Ok(None);
        }
        let mut opt_geom = Geom::load(&xtbopt)?;
        opt_geom.energy = Some(parse_energy_file(&dir.join(OUT_FN))?);
        let opt_log = if keep_log {
            Some(load_trajectory(dir.join("xtbopt.log"))?)
        } else {
            None
        };
        Ok(Some(OptResult { opt_geom, opt_log }))
    }

    /// Run `t` fs of molecular dynamics with a step of `dt` fs, writing a
    /// frame every `dump` fs. Starting `velocities`, in atomic units, must
    /// match the shape of `coords` and are checked before anything is run.
    pub fn run_md(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
        t: f64,
        dt: f64,
        velocities: Option<&[f64]>,
        dump: usize,
    ) -> Result<Vec<Geom>, ProgramError> {
        let mdrestart = velocities
            .map(|v| self.get_mdrestart_str(coords, v))
            .transpose()?;
        let dir = self.prepare_path()?;
        let restart = if mdrestart.is_some() { "true" } else { "false" };
        // xtb takes the total time in ps but the step in fs
        let md = XControl::new()
            .with("md", "hmass", 1)
            .with("md", "dump", dump)
            .with("md", "nvt", false)
            .with("md", "restart", restart)
            .with("md", "time", t / 1000.0)
            .with("md", "shake", 0)
            .with("md", "step", dt)
            .with("md", "velo", false);
        if let Some(s) = &mdrestart {
            self.write_mdrestart(dir.path(), s)?;
        }
        self.prepare_input(dir.path(), atoms, coords, None, &md)?;
        let mut args = self.add_args();
        args.extend(string!["--input", XCONTROL_FN, "--md"]);
        self.run(&dir, atoms, coords, Calc::Md, None, args, true)?
            .into_md()
    }

    fn parse_md(&self, dir: &Path) -> Result<Vec<Geom>, ProgramError> {
        if !dir.join("xtbmdok").is_file() {
            return Err(ProgramError::MdNotFinished(
                dir.to_string_lossy().to_string(),
            ));
        }
        load_trajectory(dir.join("xtb.trj"))
    }

    pub fn get_mdrestart_str(
        &self,
        coords: &[f64],
        velocities: &[f64],
    ) -> Result<String, ProgramError> {
        mdrestart_string(coords, velocities)
    }

    /// write `mdrestart` into `dir`. the contents must be plain ASCII
    pub fn write_mdrestart(
        &self,
        dir: &Path,
        mdrestart: &str,
    ) -> Result<(), ProgramError> {
        let path = dir.join(MDRESTART_FN);
        if !mdrestart.is_ascii() {
            return Err(ProgramError::WriteFileError(
                path.to_string_lossy().to_string(),
                std::io::ErrorKind::InvalidData,
            ));
        }
        write(&path, mdrestart.as_bytes())
            .map_err(|e| ProgramError::write(&path, e))
    }

    /// Build a GFN-FF topology for `coords` with `xtb topo` and return the
    /// path where it was retained
    pub fn run_topo(
        &mut self,
        atoms: &[impl AsRef<str>],
        coords: &[f64],
    ) -> Result<PathBuf, ProgramError> {
        let dir = self.prepare_path()?;
        let mut cmd = self.base_cmd.clone();
        cmd.push("topo".to_owned());
        self.run(&dir, atoms, coords, Calc::Topo, Some(cmd), Vec::new(), true)?
            .into_topo()
    }

    fn parse_topo(&self, dir: &Path) -> Result<PathBuf, ProgramError> {
        let topo = dir.join(TOPO_FN);
        if !topo.is_file() {
            return Err(ProgramError::FileNotFound(
                topo.to_string_lossy().to_string(),
            ));
        }
        self.persist(&topo, TOPO_FN)
    }

    /// read the charges file at `path`, or the last one retained
    pub fn parse_charges(
        &self,
        path: Option<&Path>,
    ) -> Result<Vec<f64>, ProgramError> {
        let path = path.or(self.charges.as_deref()).ok_or_else(|| {
            ProgramError::FileNotFound("charges".to_owned())
        })?;
        parse::parse_charges(path)
    }

    /// read the partial charges from the JSON output at `path`, or the last
    /// one retained
    pub fn parse_charges_from_json(
        &self,
        path: Option<&Path>,
    ) -> Result<Vec<f64>, ProgramError> {
        let path = path.or(self.json.as_deref()).ok_or_else(|| {
            ProgramError::FileNotFound("xtbout.json".to_owned())
        })?;
        parse::parse_charges_from_json(path)
    }

    /// the extra arguments for retrying a failed calculation at a higher
    /// electronic temperature, if `retry_etemp` is set
    pub fn get_retry_args(&self) -> Vec<String> {
        let Some(etemp) = self.config.retry_etemp else {
            return Vec::new();
        };
        info!("retrying calculation with increased etemp={etemp}");
        string!["--etemp", Value::Float(etemp).to_string()]
    }
}

impl<R: Runner> std::fmt::Display for Xtb<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xtb calculator")
    }
}
