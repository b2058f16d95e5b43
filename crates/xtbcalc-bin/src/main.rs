use std::path::Path;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::warn;
use xtbcalc::{CalcResult, Config, Geom, Xtb, program::check_termination};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// energy from a gradient calculation
    Energy,
    Grad,
    Hess,
    /// tight optimization with xtb's own optimizer
    Opt,
    Md,
    /// build a GFN-FF topology
    Topo,
}

/// run a single xtb calculation and print the result as JSON
#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(value_parser, default_value_t = String::from("xtb.toml"))]
    config: String,

    /// XYZ geometry, in Å
    geom: Option<String>,

    /// The kind of calculation to run.
    #[arg(short, long, value_enum, default_value_t = Mode::Grad)]
    calc: Mode,

    /// Total MD simulation time in fs.
    #[arg(long, default_value_t = 100.0)]
    time: f64,

    /// MD time step in fs.
    #[arg(long, default_value_t = 0.5)]
    step: f64,

    /// Write an MD frame every `dump` fs.
    #[arg(long, default_value_t = 1)]
    dump: usize,

    /// Include every step of an optimization in the output. Defaults to false.
    #[arg(long, default_value_t = false)]
    keep_log: bool,

    /// Report whether the given xtb output file shows normal termination and
    /// exit.
    #[arg(long)]
    check: Option<String>,

    /// Serialize the config file to JSON and exit.
    #[arg(short, default_value_t = false, hide = true)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if let Some(out) = &args.check {
        println!("{}", check_termination(Path::new(out))?);
        return Ok(());
    }
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    if args.json {
        println!("{}", serde_json::to_string(&config)?);
        return Ok(());
    }

    let Some(geom) = &args.geom else {
        anyhow::bail!("a geometry file is required to run a calculation");
    };
    let geom =
        Geom::load(geom).with_context(|| format!("loading {geom}"))?;
    let labels = geom.labels();
    let labels = &labels[..];
    let coords = geom.coords();

    let mut xtb = Xtb::new(config)?;
    let res = match args.calc {
        Mode::Energy => {
            CalcResult::Energy(xtb.get_energy(labels, &coords, None)?)
        }
        Mode::Grad => CalcResult::Forces(xtb.get_forces(labels, &coords, None)?),
        Mode::Hess => {
            CalcResult::Hessian(xtb.get_hessian(labels, &coords, None)?)
        }
        Mode::Opt => {
            let opt = xtb.run_opt(labels, &coords, true, args.keep_log)?;
            if opt.is_none() {
                warn!("optimization did not converge");
            }
            CalcResult::Opt(opt)
        }
        Mode::Md => CalcResult::Md(xtb.run_md(
            labels,
            &coords,
            args.time,
            args.step,
            None,
            args.dump,
        )?),
        Mode::Topo => CalcResult::Topo(xtb.run_topo(labels, &coords)?),
    };

    println!("{}", serde_json::to_string_pretty(&res)?);

    Ok(())
}
