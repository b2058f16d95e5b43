use std::{error::Error, fmt::Display, io::ErrorKind};

#[derive(Debug, PartialEq, Eq)]
pub enum ProgramError {
    FileNotFound(String),
    ReadFileError(String, ErrorKind),
    WriteFileError(String, ErrorKind),
    EnergyNotFound(String),
    EnergyParseError(String),
    GradientParseError(String),
    ChargesParseError(String),
    GeomParse(String),
    GeomNotFound(String),

    /// the Hessian file and the number of values found in it
    HessianNotSquare(String, usize),

    /// xtb exited without writing its `xtbmdok` marker
    MdNotFinished(String),

    /// the number of atoms in the coordinates and in the velocities
    ShapeMismatch {
        coords: usize,
        velocities: usize,
    },

    IncompatibleEtemp,
    InvalidGfn(String),
    InvalidMultiplicity(usize),

    /// the command that could not be started
    SpawnError(String, ErrorKind),

    Config(String),

    /// a parser produced a result that does not belong to the requested
    /// calculation
    UnexpectedResult(String),
}

impl ProgramError {
    /// Returns `true` if the program error is [`FileNotFound`].
    ///
    /// [`FileNotFound`]: ProgramError::FileNotFound
    #[must_use]
    pub fn is_file_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound(..))
    }

    /// map an io error on reading `path` to [ProgramError::FileNotFound] or
    /// [ProgramError::ReadFileError]
    pub(crate) fn read(
        path: impl AsRef<std::path::Path>,
        e: std::io::Error,
    ) -> Self {
        let name = path.as_ref().to_string_lossy().to_string();
        match e.kind() {
            ErrorKind::NotFound => Self::FileNotFound(name),
            kind => Self::ReadFileError(name, kind),
        }
    }

    pub(crate) fn write(
        path: impl AsRef<std::path::Path>,
        e: std::io::Error,
    ) -> Self {
        let name = path.as_ref().to_string_lossy().to_string();
        Self::WriteFileError(name, e.kind())
    }
}

impl Display for ProgramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Error for ProgramError {}
