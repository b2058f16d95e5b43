//! Run the xtb semiempirical program as an external calculator: write its
//! control and coordinate files, invoke it, and parse energies, gradients,
//! Hessians, optimized geometries, and MD trajectories back out of its output.

pub mod atom;
pub mod config;
pub mod error;
pub mod geom;
pub mod pointcharges;
pub mod program;
pub mod runner;
pub mod xcontrol;

pub use atom::Atom;
pub use config::{Config, Gfn};
pub use error::ProgramError;
pub use geom::Geom;
pub use program::{Calc, CalcResult, Forces, Hessian, OptResult, Xtb};
pub use runner::{Invocation, Local, Runner};
pub use xcontrol::{Value, XControl};

/// Å per bohr
pub const BOHR2ANG: f64 = 0.529177210903;

/// from [StackOverflow](https://stackoverflow.com/a/45145246)
#[macro_export]
macro_rules! string {
    // match a list of expressions separated by comma, with an optional
    // trailing comma:
    ($($str:expr),* $(,)?) => ({
        // create a Vec with this list of expressions,
        // calling String::from on each:
        vec![$(String::from($str),)*] as Vec<String>
    });
}
