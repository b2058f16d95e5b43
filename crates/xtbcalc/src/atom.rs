use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ProgramError;

/// A single atom. The unit of the coordinates is decided by the container:
/// [crate::Geom] always stores bohr.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Atom {
    pub atomic_number: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        let eps = 1e-8;
        let close = |a: f64, b: f64| (a - b).abs() < eps;
        self.atomic_number == other.atomic_number
            && close(self.x, other.x)
            && close(self.y, other.y)
            && close(self.z, other.z)
    }
}

impl Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:2} {:15.10} {:15.10} {:15.10}",
            self.label(),
            self.x,
            self.y,
            self.z
        )
    }
}

impl FromStr for Atom {
    type Err = ProgramError;

    /// parse an Atom from a line like
    ///  C 1.0 1.0 1.0
    /// where the label can also be an atomic number.
    /// trailing fields after the coordinates are ignored, since some xtb
    /// outputs append per-atom data there
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ProgramError::GeomParse(s.to_owned());
        let mut fields = s.split_whitespace();
        let label = fields.next().ok_or_else(err)?;
        let mut coord = [0.0; 3];
        for c in &mut coord {
            *c = fields
                .next()
                .and_then(|f| f.parse().ok())
                .ok_or_else(err)?;
        }
        let [x, y, z] = coord;
        match label.parse::<usize>() {
            Ok(n) if (1..NUMBER_TO_SYMBOL.len()).contains(&n) => {
                Ok(Self::new(n, x, y, z))
            }
            Ok(_) => Err(err()),
            Err(_) => Self::from_label(label, x, y, z).ok_or_else(err),
        }
    }
}

/// element symbols up to radon, the heaviest element parameterized in the
/// GFN Hamiltonians
pub const NUMBER_TO_SYMBOL: [&str; 87] = [
    "X", "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg",
    "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn",
    "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb",
    "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In",
    "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", "Pm",
    "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta",
    "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At",
    "Rn",
];

/// look up the atomic number for `s`, ignoring case
pub fn symbol_to_number(s: &str) -> Option<usize> {
    let s = titlecase(s);
    NUMBER_TO_SYMBOL.iter().skip(1).position(|&x| x == s).map(|i| i + 1)
}

fn titlecase(s: &str) -> String {
    let mut cs = s.chars();
    let Some(first) = cs.next() else {
        return String::new();
    };
    let mut ret = first.to_uppercase().to_string();
    ret.extend(cs.flat_map(char::to_lowercase));
    ret
}

impl Atom {
    pub fn new(atomic_number: usize, x: f64, y: f64, z: f64) -> Self {
        Self {
            atomic_number,
            x,
            y,
            z,
        }
    }

    /// Returns `None` if `atomic_symbol` is not a known element
    pub fn from_label(
        atomic_symbol: &str,
        x: f64,
        y: f64,
        z: f64,
    ) -> Option<Self> {
        symbol_to_number(atomic_symbol).map(|n| Self::new(n, x, y, z))
    }

    #[inline]
    pub const fn label(&self) -> &str {
        debug_assert!(self.atomic_number != 0 && self.atomic_number < 87);
        NUMBER_TO_SYMBOL[self.atomic_number]
    }

    pub fn coord(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}
