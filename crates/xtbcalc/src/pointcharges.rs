use std::{fmt::Write, path::Path};

use crate::{BOHR2ANG, error::ProgramError};

/// hardness assigned to every embedding charge
pub const PC_HARDNESS: f64 = 99.0;

/// A point charge at `(x, y, z)` in bohr carrying charge `q`, in that order
pub type PointCharge = [f64; 4];

/// render `charges` in the ORCA point-charge format read by xtb's embedding:
/// the number of charges, then one `q x y z [hardness]` line per charge with
/// the positions in Å
pub fn pc_string(charges: &[PointCharge], hardness: Option<f64>) -> String {
    let mut ret = String::with_capacity(85 * charges.len() + 8);
    writeln!(ret, "{}", charges.len()).unwrap();
    for &[x, y, z, q] in charges {
        write!(
            ret,
            "{q:16.10} {:16.10} {:16.10} {:16.10}",
            x * BOHR2ANG,
            y * BOHR2ANG,
            z * BOHR2ANG,
        )
        .unwrap();
        if let Some(h) = hardness {
            write!(ret, " {h:16.10}").unwrap();
        }
        ret.push('\n');
    }
    ret
}

pub fn write_pc_file(
    charges: &[PointCharge],
    path: impl AsRef<Path>,
    hardness: Option<f64>,
) -> Result<(), ProgramError> {
    let path = path.as_ref();
    std::fs::write(path, pc_string(charges, hardness))
        .map_err(|e| ProgramError::write(path, e))
}
