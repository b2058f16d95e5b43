use std::{
    collections::BTreeMap,
    fs::File,
    path::PathBuf,
    process::{Command, Stdio},
};

use log::{trace, warn};

use crate::error::ProgramError;

/// Everything needed to run xtb once. The coordinate file has already been
/// written to `dir/inp_fn` by the time a [Runner] sees this
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    /// the base command, e.g. `["xtb"]` or `["xtb", "topo"]`
    pub cmd: Vec<String>,

    /// arguments following the coordinate file
    pub args: Vec<String>,

    /// variables added to the inherited environment
    pub env: BTreeMap<String, String>,

    /// the working directory
    pub dir: PathBuf,

    /// the coordinate file, relative to `dir`
    pub inp_fn: String,

    /// the file receiving standard output, relative to `dir`
    pub out_fn: String,
}

impl Invocation {
    /// the full argument vector, starting with the program
    pub fn argv(&self) -> Vec<String> {
        let mut ret = self.cmd.clone();
        ret.push(self.inp_fn.clone());
        ret.extend(self.args.iter().cloned());
        ret
    }
}

/// A trait for anything that can carry out an [Invocation]. Parsing the
/// results is left to the caller, who reads them from `Invocation::dir`
pub trait Runner {
    fn run(&self, inv: &Invocation) -> Result<(), ProgramError>;
}

/// Run xtb directly as a child process and block until it exits
#[derive(Debug, Default)]
pub struct Local;

impl Runner for Local {
    fn run(&self, inv: &Invocation) -> Result<(), ProgramError> {
        let argv = inv.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(ProgramError::SpawnError(
                String::new(),
                std::io::ErrorKind::InvalidInput,
            ));
        };
        let out_path = inv.dir.join(&inv.out_fn);
        let stdout = File::create(&out_path)
            .map_err(|e| ProgramError::write(&out_path, e))?;
        trace!("running {argv:?} in {}", inv.dir.display());
        let output = Command::new(program)
            .args(args)
            .envs(&inv.env)
            .current_dir(&inv.dir)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| ProgramError::SpawnError(argv.join(" "), e.kind()))?;
        if !output.status.success() {
            // a failed run can still leave useful output behind, so the
            // parsers decide whether it is usable
            warn!(
                "`{}` exited with {}: {}",
                argv.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
