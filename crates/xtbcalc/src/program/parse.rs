//! Readers for the files xtb leaves in its working directory

use std::{
    fmt::Write,
    fs::read_to_string,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use log::trace;
use nalgebra::{DMatrix, DVector};
use regex::Regex;

use crate::error::ProgramError;

use super::{Forces, Hessian};

static ENERGY_CELL: OnceLock<Regex> = OnceLock::new();
static GRAD_CELL: OnceLock<[Regex; 2]> = OnceLock::new();
static TERM_CELL: OnceLock<Regex> = OnceLock::new();

/// sentinel on the first line of an xtb `mdrestart` file
pub const MDRESTART_SENTINEL: &str = "-1.0";

fn read(path: &Path) -> Result<String, ProgramError> {
    read_to_string(path).map_err(|e| ProgramError::read(path, e))
}

fn name(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// parse a Fortran-style float, accepting `D` as the exponent marker
#[inline]
fn parse_float(s: &str) -> Option<f64> {
    s.replace(['D', 'd'], "E").parse().ok()
}

/// read the final energy from the text of the main xtb output, the
/// `| TOTAL ENERGY  -5.070544797559 Eh |` line of the summary block
pub fn parse_energy(contents: &str, outname: &str) -> Result<f64, ProgramError> {
    let energy_re = ENERGY_CELL.get_or_init(|| {
        trace!("initializing xtb energy regex");
        Regex::new(r"TOTAL ENERGY\s*([-\d.]+) Eh").unwrap()
    });
    let Some(caps) = energy_re.captures(contents) else {
        return Err(ProgramError::EnergyNotFound(outname.to_owned()));
    };
    caps[1]
        .parse()
        .map_err(|_| ProgramError::EnergyParseError(outname.to_owned()))
}

/// read the energy from the output file at `path`
pub fn parse_energy_file(path: &Path) -> Result<f64, ProgramError> {
    parse_energy(&read(path)?, &name(path))
}

/// Read a Turbomole-style `gradient` file like
///
/// ```text
/// $grad
///   cycle =      1    SCF energy =    -5.07054479756   |dE/xyz| =  0.000474
///     0.00000000000000      0.00000000000000     -0.73020562946046      o
///     ...
///    0.0000000000000D+00   0.0000000000000D+00  -3.3490289052766D-04
///     ...
/// $end
/// ```
///
/// Only the last cycle is used. The returned forces are the negative gradient.
pub fn parse_gradient(path: &Path) -> Result<Forces, ProgramError> {
    let contents = read(path)?;
    let outname = name(path);
    let [cycle_re, energy_re] = GRAD_CELL.get_or_init(|| {
        [
            Regex::new(r"^\s*cycle\s*=").unwrap(),
            Regex::new(r"energy\s*=\s*([-+\d.EeDd]+)").unwrap(),
        ]
    });

    let bad = || ProgramError::GradientParseError(outname.clone());

    // the block belonging to the last cycle
    let lines: Vec<&str> = contents.lines().collect();
    let Some(start) = lines.iter().rposition(|l| cycle_re.is_match(l)) else {
        return Err(bad());
    };
    let energy = energy_re
        .captures(lines[start])
        .and_then(|c| parse_float(&c[1]))
        .ok_or_else(|| ProgramError::EnergyNotFound(outname.clone()))?;

    let mut natoms = 0;
    let mut gradient = Vec::new();
    for line in &lines[start + 1..] {
        let line = line.trim();
        if line.starts_with('$') {
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.len() {
            4 => natoms += 1,
            3 => {
                for f in fields {
                    gradient.push(parse_float(f).ok_or_else(bad)?);
                }
            }
            0 => {}
            _ => return Err(bad()),
        }
    }
    if natoms == 0 || gradient.len() != 3 * natoms {
        return Err(bad());
    }

    Ok(Forces {
        energy,
        forces: -DVector::from_vec(gradient),
    })
}

/// Read the `hessian` file at `path` as a square matrix. A leading header
/// token like `$hessian` is skipped, and the number of values must be a
/// perfect square. The energy is not part of this file, so it is left for the
/// caller to fill in.
pub fn parse_hessian_matrix(path: &Path) -> Result<DMatrix<f64>, ProgramError> {
    let contents = read(path)?;
    let mut tokens = contents.split_whitespace().peekable();
    if tokens.peek().is_some_and(|t| parse_float(t).is_none()) {
        tokens.next();
    }
    let values = tokens
        .map(|t| {
            parse_float(t).ok_or_else(|| {
                ProgramError::ReadFileError(
                    name(path),
                    std::io::ErrorKind::InvalidData,
                )
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let n = values.len();
    let side = n.isqrt();
    if n == 0 || side * side != n {
        return Err(ProgramError::HessianNotSquare(name(path), n));
    }
    Ok(DMatrix::from_row_slice(side, side, &values))
}

/// read the Hessian from `dir/hessian` and its energy from `dir/out_fn`
pub fn parse_hessian(dir: &Path, out_fn: &str) -> Result<Hessian, ProgramError> {
    let hessian = parse_hessian_matrix(&dir.join("hessian"))?;
    let energy = parse_energy_file(&dir.join(out_fn))?;
    Ok(Hessian { energy, hessian })
}

/// read the whitespace-separated partial charges written to `charges`
pub fn parse_charges(path: &Path) -> Result<Vec<f64>, ProgramError> {
    read(path)?
        .split_whitespace()
        .map(|s| {
            parse_float(s)
                .ok_or_else(|| ProgramError::ChargesParseError(name(path)))
        })
        .collect()
}

/// read the `"partial charges"` array from xtb's JSON output
pub fn parse_charges_from_json(path: &Path) -> Result<Vec<f64>, ProgramError> {
    let contents = read(path)?;
    let bad = || ProgramError::ChargesParseError(name(path));
    let dump: serde_json::Value =
        serde_json::from_str(&contents).map_err(|_| bad())?;
    let charges = dump.get("partial charges").ok_or_else(bad)?;
    serde_json::from_value(charges.clone()).map_err(|_| bad())
}

/// Either the contents of an output file or the path to one
#[derive(Clone, Copy, Debug)]
pub enum TextSource<'a> {
    File(&'a Path),
    Text(&'a str),
}

impl<'a> From<&'a Path> for TextSource<'a> {
    fn from(value: &'a Path) -> Self {
        Self::File(value)
    }
}

impl<'a> From<&'a PathBuf> for TextSource<'a> {
    fn from(value: &'a PathBuf) -> Self {
        Self::File(value)
    }
}

impl<'a> From<&'a str> for TextSource<'a> {
    /// a string naming an existing `.out` file is treated as that file,
    /// anything else as the text itself
    fn from(value: &'a str) -> Self {
        let path = Path::new(value);
        if path.extension().is_some_and(|e| e == "out") && path.is_file() {
            Self::File(path)
        } else {
            Self::Text(value)
        }
    }
}

impl<'a> From<&'a String> for TextSource<'a> {
    fn from(value: &'a String) -> Self {
        Self::from(value.as_str())
    }
}

/// report whether an xtb output log contains the `finished run on` line that
/// xtb prints on normal termination
pub fn check_termination<'a>(
    src: impl Into<TextSource<'a>>,
) -> Result<bool, ProgramError> {
    let term_re = TERM_CELL.get_or_init(|| Regex::new("finished run on").unwrap());
    Ok(match src.into() {
        TextSource::File(path) => term_re.is_match(&read(path)?),
        TextSource::Text(text) => term_re.is_match(text),
    })
}

/// format `x` like C's `% .{prec}e`: a space in place of a plus sign and at
/// least two exponent digits, with `marker` as the exponent character
fn sci(x: f64, prec: usize, marker: char) -> String {
    let sign = if x.is_sign_negative() { '-' } else { ' ' };
    let s = format!("{:.*e}", prec, x.abs());
    let Some((mant, exp)) = s.split_once('e') else {
        // inf and NaN
        return format!("{sign}{s}");
    };
    let exp: i32 = exp.parse().unwrap_or_default();
    let esign = if exp < 0 { '-' } else { '+' };
    format!("{sign}{mant}{marker}{esign}{:02}", exp.abs())
}

/// Render an xtb `mdrestart` file from `coords` in bohr and `velocities` in
/// atomic units, both flattened. Each line holds one atom's position and
/// velocity in Fortran `D` notation, after the sentinel first line, and every
/// line is indented by one space.
pub fn mdrestart_string(
    coords: &[f64],
    velocities: &[f64],
) -> Result<String, ProgramError> {
    if coords.len() != velocities.len()
        || coords.len() % 3 != 0
        || velocities.len() % 3 != 0
    {
        return Err(ProgramError::ShapeMismatch {
            coords: coords.len() / 3,
            velocities: velocities.len() / 3,
        });
    }
    let mut ret = String::with_capacity(130 * coords.len() / 3 + 8);
    writeln!(ret, " {MDRESTART_SENTINEL}").unwrap();
    for (c, v) in coords.chunks_exact(3).zip(velocities.chunks_exact(3)) {
        let row: Vec<String> =
            c.iter().chain(v).map(|&x| sci(x, 14, 'D')).collect();
        writeln!(ret, " {}", row.join(" ")).unwrap();
    }
    Ok(ret)
}
