use std::{
    fmt::{Display, Write},
    path::Path,
    str::FromStr,
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{BOHR2ANG, atom::Atom, error::ProgramError};

static ENERGY_CELL: OnceLock<Regex> = OnceLock::new();

/// A molecular geometry with coordinates in bohr, optionally carrying the
/// energy xtb reported for it
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Geom {
    pub atoms: Vec<Atom>,
    pub energy: Option<f64>,
}

impl Display for Geom {
    /// XYZ format in Å
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let comment = self
            .energy
            .map(|e| format!(" energy: {e:.12}"))
            .unwrap_or_default();
        let labels = self.labels();
        write!(f, "{}", xyz_string(&labels[..], &self.coords(), &comment))
    }
}

impl FromStr for Geom {
    type Err = ProgramError;

    /// parse the first frame of an XYZ file with coordinates in Å
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_frames(s)?
            .into_iter()
            .next()
            .ok_or_else(|| ProgramError::GeomNotFound(String::new()))
    }
}

impl Geom {
    /// build a [Geom] from element symbols and a flat array of coordinates in
    /// bohr
    pub fn new(
        labels: &[impl AsRef<str>],
        coords: &[f64],
    ) -> Result<Self, ProgramError> {
        if coords.len() != 3 * labels.len() {
            return Err(ProgramError::GeomParse(format!(
                "{} coordinates for {} atoms",
                coords.len(),
                labels.len()
            )));
        }
        let atoms = labels
            .iter()
            .zip(coords.chunks_exact(3))
            .map(|(l, c)| {
                Atom::from_label(l.as_ref(), c[0], c[1], c[2]).ok_or_else(
                    || ProgramError::GeomParse(l.as_ref().to_owned()),
                )
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            atoms,
            energy: None,
        })
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.atoms.iter().map(Atom::label).collect()
    }

    /// the flattened coordinates in bohr
    pub fn coords(&self) -> Vec<f64> {
        self.atoms.iter().flat_map(Atom::coord).collect()
    }

    /// load the first geometry from the XYZ file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProgramError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| ProgramError::read(path, e))?;
        parse_frames(&s)?.into_iter().next().ok_or_else(|| {
            ProgramError::GeomNotFound(path.to_string_lossy().to_string())
        })
    }
}

/// load every frame of the multi-frame XYZ file at `path`, like the `xtb.trj`
/// and `xtbopt.log` files written during MD runs and optimizations
pub fn load_trajectory(
    path: impl AsRef<Path>,
) -> Result<Vec<Geom>, ProgramError> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path)
        .map_err(|e| ProgramError::read(path, e))?;
    parse_frames(&s)
}

/// parse concatenated XYZ frames. coordinates are converted from Å to bohr,
/// and an `energy: E` entry in a comment line is attached to its frame
pub fn parse_frames(s: &str) -> Result<Vec<Geom>, ProgramError> {
    let energy_re = ENERGY_CELL
        .get_or_init(|| Regex::new(r"energy:\s*([-+\d.EeDd]+)").unwrap());
    let mut lines = s.lines();
    let mut ret = Vec::new();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let natoms: usize = line
            .parse()
            .map_err(|_| ProgramError::GeomParse(line.to_owned()))?;
        let energy = lines
            .next()
            .and_then(|c| energy_re.captures(c))
            .and_then(|c| c[1].replace(['D', 'd'], "E").parse().ok());
        let mut atoms = Vec::with_capacity(natoms);
        for _ in 0..natoms {
            let Some(line) = lines.next() else {
                return Err(ProgramError::GeomParse(format!(
                    "expected {natoms} atoms, found {}",
                    atoms.len()
                )));
            };
            let mut atom: Atom = line.parse()?;
            atom.x /= BOHR2ANG;
            atom.y /= BOHR2ANG;
            atom.z /= BOHR2ANG;
            atoms.push(atom);
        }
        ret.push(Geom { atoms, energy });
    }
    Ok(ret)
}

/// render `labels` and the flat `coords` in bohr as an XYZ block in Å
pub fn xyz_string(
    labels: &[impl AsRef<str>],
    coords: &[f64],
    comment: &str,
) -> String {
    let mut ret = String::with_capacity(50 * labels.len() + 32);
    writeln!(ret, "{}", labels.len()).unwrap();
    writeln!(ret, "{comment}").unwrap();
    for (l, c) in labels.iter().zip(coords.chunks_exact(3)) {
        writeln!(
            ret,
            "{:>3} {:15.10} {:15.10} {:15.10}",
            l.as_ref(),
            c[0] * BOHR2ANG,
            c[1] * BOHR2ANG,
            c[2] * BOHR2ANG,
        )
        .unwrap();
    }
    ret
}
