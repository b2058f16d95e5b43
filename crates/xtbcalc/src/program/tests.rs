use std::{
    cell::{Cell, RefCell},
    fs::{read_dir, read_to_string},
};

use approx::assert_abs_diff_eq;
use insta::assert_snapshot;
use tempfile::TempDir;

use super::*;
use crate::{BOHR2ANG, config::Gfn};

const WATER: [&str; 3] = ["O", "H", "H"];

const COORDS: [f64; 9] = [
    0.0, 0.0, -0.73, //
    1.4325, 0.0, 0.365, //
    -1.4325, 0.0, 0.365,
];

fn fixture(case: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("testfiles/xtb")
        .join(case)
}

/// the working directory as xtb found it
#[derive(Debug)]
struct Call {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    xcontrol: Option<String>,
    topo: Option<String>,
    xtbrestart: Option<String>,
    mdrestart: Option<String>,
    pointcharges: Option<String>,
}

/// A [Runner] that copies canned output into the working directory instead of
/// running xtb. `topo` calls write a numbered topology file
#[derive(Debug, Default)]
struct Fake {
    /// fixture directory overriding the one chosen from the arguments
    case: Option<&'static str>,
    calls: RefCell<Vec<Call>>,
    topos: Cell<usize>,
}

impl Fake {
    fn new(case: &'static str) -> Self {
        Self {
            case: Some(case),
            ..Self::default()
        }
    }

    /// the calls that were not topology builds
    fn calcs(&self) -> Vec<Call> {
        self.calls
            .take()
            .into_iter()
            .filter(|c| !c.argv.iter().any(|a| a == "topo"))
            .collect()
    }
}

impl Runner for Fake {
    fn run(&self, inv: &Invocation) -> Result<(), ProgramError> {
        let argv = inv.argv();
        let slurp = |name: &str| read_to_string(inv.dir.join(name)).ok();
        self.calls.borrow_mut().push(Call {
            argv: argv.clone(),
            env: inv.env.clone(),
            xcontrol: slurp(XCONTROL_FN),
            topo: slurp(TOPO_FN),
            xtbrestart: slurp("xtbrestart"),
            mdrestart: slurp(MDRESTART_FN),
            pointcharges: slurp(PC_FN),
        });

        let has = |flag: &str| argv.iter().any(|a| a == flag);
        if has("topo") {
            let n = self.topos.get() + 1;
            self.topos.set(n);
            std::fs::write(inv.dir.join(TOPO_FN), format!("topology {n}\n"))
                .unwrap();
            return Ok(());
        }
        let case = self.case.unwrap_or(if has("--hess") {
            "hess"
        } else if has("--opt") {
            "opt"
        } else if has("--md") {
            "md"
        } else {
            "grad"
        });
        for entry in read_dir(fixture(case)).unwrap() {
            let entry = entry.unwrap();
            copy(entry.path(), inv.dir.join(entry.file_name())).unwrap();
        }
        Ok(())
    }
}

fn config(out: &TempDir) -> Config {
    Config::new()
        .cmd(string!["xtb"])
        .out_dir(out.path().to_owned())
}

/// sorted names of the files in `dir`
fn listing(dir: &TempDir) -> Vec<String> {
    let mut ret: Vec<_> = read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    ret.sort();
    ret
}

#[test]
fn default_args() {
    let out = TempDir::new().unwrap();
    let xtb = Xtb::new(config(&out)).unwrap();
    assert_eq!(
        xtb.add_args(),
        vec![
            "--input",
            "xcontrol",
            "--chrg",
            "0",
            "--uhf",
            "0",
            "--acc",
            "1.0",
            "--iterations",
            "250",
            "--gfn",
            "2"
        ]
    );
    assert_eq!(xtb.base_cmd(), &["xtb"]);
}

#[test]
fn full_args() {
    let out = TempDir::new().unwrap();
    let conf = config(&out)
        .charge(-1)
        .mult(2)
        .acc(0.5)
        .iterations(100)
        .etemp(500.0)
        .alpb("water")
        .gfn(Gfn::Ff);
    let xtb = Xtb::new(conf).unwrap();
    assert_eq!(
        xtb.add_args().join(" "),
        "--input xcontrol --chrg -1 --uhf 1 --acc 0.5 --iterations 100 \
--etemp 500.0 --alpb water --gfnff"
    );
}

#[test]
fn gbsa_beats_alpb() {
    let out = TempDir::new().unwrap();
    let conf = config(&out).gbsa("h2o").alpb("water").gfn(Gfn::Gfn1);
    let xtb = Xtb::new(conf).unwrap();
    let args = xtb.add_args();
    assert_eq!(&args[args.len() - 4..], &["--gbsa", "h2o", "--gfn", "1"]);
    assert!(!args.contains(&"--alpb".to_owned()));
}

#[test]
fn empty_solvent_is_ignored() {
    let out = TempDir::new().unwrap();
    let xtb = Xtb::new(config(&out).gbsa("").alpb("water")).unwrap();
    assert!(xtb.add_args().join(" ").contains("--alpb water"));
}

#[test]
fn pal_env() {
    let out = TempDir::new().unwrap();
    let xtb = Xtb::new(config(&out).pal(4).mem(2000)).unwrap();
    assert_eq!(
        xtb.pal_env(),
        BTreeMap::from([
            ("MKL_NUM_THREADS".to_owned(), "4".to_owned()),
            ("OMP_NUM_THREADS".to_owned(), "4".to_owned()),
            ("OMP_STACKSIZE".to_owned(), "2000M".to_owned()),
        ])
    );
}

#[test]
fn incompatible_etemp() {
    let out = TempDir::new().unwrap();
    let conf = config(&out).etemp(300.0).retry_etemp(1000.0);
    let got = Xtb::with_runner(conf, Fake::default());
    assert_eq!(got.unwrap_err(), ProgramError::IncompatibleEtemp);
}

#[test]
fn retry_args() {
    let out = TempDir::new().unwrap();
    let xtb = Xtb::new(config(&out).retry_etemp(1000.0)).unwrap();
    assert_eq!(xtb.get_retry_args(), vec!["--etemp", "1000.0"]);
    let xtb = Xtb::new(config(&out)).unwrap();
    assert!(xtb.get_retry_args().is_empty());
}

#[test]
fn forces() {
    let out = TempDir::new().unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out).pal(2), Fake::default()).unwrap();
    let got = xtb.get_forces(&WATER, &COORDS, None).unwrap();
    assert_eq!(got.energy, -5.07054479756);
    assert_abs_diff_eq!(got.forces[2], 3.3490289052766e-4);
    assert_eq!(xtb.calc_number(), 1);

    let calls = xtb.runner().calcs();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert_eq!(call.argv[..2], ["xtb", "xtb.xyz"]);
    assert_eq!(call.argv.last().unwrap(), "--grad");
    assert_eq!(call.env["OMP_NUM_THREADS"], "2");
    assert!(call.pointcharges.is_none());
    assert_eq!(
        call.xcontrol.as_deref(),
        Some("$write\n    json=true\n$end")
    );

    assert_eq!(
        listing(&out),
        vec![
            "calculator.000.charges",
            "calculator.000.gradient",
            "calculator.000.xcontrol",
            "calculator.000.xtb.out",
            "calculator.000.xtbout.json",
        ]
    );
    assert_eq!(
        xtb.parse_charges(None).unwrap(),
        vec![-0.56543, 0.28271, 0.28272]
    );
    assert_eq!(
        xtb.parse_charges_from_json(None).unwrap(),
        vec![-0.565431, 0.282715, 0.282716]
    );
}

#[test]
fn energy_discards_forces() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb.get_energy(&WATER, &COORDS, None).unwrap();
    assert_eq!(got, -5.07054479756);
    assert_eq!(
        xtb.run_calculation(&WATER, &COORDS, None).unwrap(),
        -5.07054479756
    );
    assert_eq!(xtb.calc_number(), 2);
    assert!(out.path().join("calculator.001.gradient").exists());
}

#[test]
fn calculate_modes() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb.calculate(Calc::Energy, &WATER, &COORDS, None).unwrap();
    assert_eq!(got, CalcResult::Energy(-5.070544797559));
    let got = xtb.calculate(Calc::NoParse, &WATER, &COORDS, None).unwrap();
    assert_eq!(got, CalcResult::None);
    let got = xtb.calculate(Calc::Md, &WATER, &COORDS, None);
    assert!(matches!(got, Err(ProgramError::UnexpectedResult(_))));

    let calls = xtb.runner().calcs();
    assert_eq!(calls.len(), 2);
    // a plain single point has no mode flag
    assert_eq!(calls[0].argv.last().unwrap(), "2");
}

#[test]
fn wrong_variant() {
    let got = CalcResult::Energy(1.0).into_forces();
    assert!(matches!(got, Err(ProgramError::UnexpectedResult(_))));
    assert_eq!(CalcResult::Topo("t".into()).into_topo(), Ok("t".into()));
}

#[test]
fn staging() {
    let out = TempDir::new().unwrap();
    let opts = XControl::new()
        .with("scc", "temp", 400.0)
        .with("scc", "maxiterations", 500);
    let mut xtb =
        Xtb::with_runner(config(&out).xtb_options(opts), Fake::default())
            .unwrap();
    let pcs = [[0.0, 0.0, 1.0, -0.834], [1.0, 0.0, 0.0, 0.417]];
    xtb.get_forces(&WATER, &COORDS, Some(&pcs)).unwrap();
    let calls = xtb.runner().calcs();
    assert_snapshot!(calls[0].xcontrol.clone().unwrap(), @r"
    $embedding
        input=pointcharges_inp.pc
        interface=orca
    $end
    $scc
        maxiterations=500
        temp=400.0
    $end
    $write
        json=true
    $end
    ");
    let pc = calls[0].pointcharges.clone().unwrap();
    assert!(pc.starts_with("2\n"));
    assert!(pc.lines().skip(1).all(|l| l.ends_with(" 99.0000000000")));
}

#[test]
fn user_sections_replace_generated_ones() {
    let out = TempDir::new().unwrap();
    let opts = XControl::new().with("write", "charges", true);
    let mut xtb =
        Xtb::with_runner(config(&out).xtb_options(opts), Fake::default())
            .unwrap();
    xtb.get_forces(&WATER, &COORDS, None).unwrap();
    let calls = xtb.runner().calcs();
    assert_eq!(
        calls[0].xcontrol.as_deref(),
        Some("$write\n    charges=true\n$end")
    );
}

#[test]
fn topology_refresh() {
    let out = TempDir::new().unwrap();
    let topo = out.path().join("initial_topo");
    std::fs::write(&topo, "initial\n").unwrap();
    let conf = config(&out).topo(topo).topo_update(2_usize);
    let mut xtb = Xtb::with_runner(conf, Fake::default()).unwrap();
    for _ in 0..5 {
        xtb.get_forces(&WATER, &COORDS, None).unwrap();
    }
    let got: Vec<_> = xtb
        .runner()
        .calcs()
        .into_iter()
        .map(|c| c.topo.unwrap())
        .collect();
    assert_eq!(
        got,
        vec![
            "initial\n",
            "initial\n",
            "topology 1\n",
            "topology 1\n",
            "topology 2\n"
        ]
    );
    assert_eq!(xtb.topo_used(), 5);
    // five gradients and two topology builds
    assert_eq!(xtb.calc_number(), 7);
    let want = out.path().join("calculator.005.gfnff_topo");
    assert_eq!(xtb.topo(), Some(want.as_path()));
    assert_eq!(
        read_to_string(out.path().join("calculator.002.gfnff_topo")).unwrap(),
        "topology 1\n"
    );
}

#[test]
fn topology_refresh_every_five() {
    let out = TempDir::new().unwrap();
    let topo = out.path().join("initial_topo");
    std::fs::write(&topo, "initial\n").unwrap();
    let conf = config(&out).topo(topo).topo_update(5_usize);
    let mut xtb = Xtb::with_runner(conf, Fake::default()).unwrap();
    for _ in 0..6 {
        xtb.get_forces(&WATER, &COORDS, None).unwrap();
    }
    let got: Vec<_> = xtb
        .runner()
        .calcs()
        .into_iter()
        .map(|c| c.topo.unwrap())
        .collect();
    let mut want = vec!["initial\n"; 5];
    want.push("topology 1\n");
    assert_eq!(got, want);
    assert_eq!(xtb.runner().topos.get(), 1);
    assert_eq!(xtb.topo_used(), 6);
    assert_eq!(xtb.calc_number(), 7);
    assert_eq!(
        read_to_string(out.path().join("calculator.005.gfnff_topo")).unwrap(),
        "topology 1\n"
    );
}

#[test]
fn topology_without_update() {
    let out = TempDir::new().unwrap();
    let topo = out.path().join("initial_topo");
    std::fs::write(&topo, "initial\n").unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out).topo(topo), Fake::default()).unwrap();
    for _ in 0..3 {
        xtb.get_forces(&WATER, &COORDS, None).unwrap();
    }
    assert_eq!(xtb.runner().topos.get(), 0);
    assert_eq!(xtb.topo_used(), 3);
}

#[test]
fn run_topo() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb.run_topo(&WATER, &COORDS).unwrap();
    assert_eq!(got, out.path().join("calculator.000.gfnff_topo"));
    let calls = xtb.runner().calls.take();
    assert_eq!(calls[0].argv, vec!["xtb", "topo", "xtb.xyz"]);
    // nothing is used until the topology is set in the config
    assert_eq!(xtb.topo_used(), 0);
}

#[test]
fn restart() {
    let out = TempDir::new().unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out).restart(true), Fake::default()).unwrap();
    xtb.get_forces(&WATER, &COORDS, None).unwrap();
    assert_eq!(
        xtb.xtbrestart(),
        Some(out.path().join("calculator.000.xtbrestart").as_path())
    );
    xtb.get_forces(&WATER, &COORDS, None).unwrap();
    let calls = xtb.runner().calcs();
    assert!(calls[0].xtbrestart.is_none());
    assert_eq!(
        calls[1].xtbrestart.as_deref(),
        Some("binary restart stand-in\n")
    );
}

#[test]
fn given_restart() {
    let out = TempDir::new().unwrap();
    let restart = out.path().join("restart");
    std::fs::write(&restart, "mine\n").unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    xtb.set_xtbrestart(&restart);
    xtb.get_forces(&WATER, &COORDS, None).unwrap();
    let calls = xtb.runner().calcs();
    assert_eq!(calls[0].xtbrestart.as_deref(), Some("mine\n"));
    // without restart enabled the new file is not retained
    assert_eq!(xtb.xtbrestart(), Some(restart.as_path()));
}

#[test]
fn quiet() {
    let out = TempDir::new().unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out).quiet(true), Fake::default()).unwrap();
    xtb.get_forces(&WATER, &COORDS, None).unwrap();
    assert!(listing(&out).is_empty());
    assert!(xtb.parse_charges(None).unwrap_err().is_file_not_found());
    assert_eq!(xtb.calc_number(), 1);
}

#[test]
fn hessian() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb
        .get_hessian(&["H", "H"], &[0.0, 0.0, 0.0, 0.0, 0.0, 1.4], None)
        .unwrap();
    assert_eq!(got.energy, -1.036758917307);
    assert_eq!(got.hessian.shape(), (6, 6));
    assert_eq!(got.hessian, got.hessian.transpose());
    let calls = xtb.runner().calcs();
    assert_eq!(calls[0].argv.last().unwrap(), "--hess");
}

#[test]
fn hessian_not_square() {
    let out = TempDir::new().unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out), Fake::new("hess_bad")).unwrap();
    let got = xtb.get_hessian(&["H", "H"], &[0.0; 6], None);
    assert!(matches!(got, Err(ProgramError::HessianNotSquare(_, 35))));
}

#[test]
fn opt() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb.run_opt(&WATER, &COORDS, true, true).unwrap().unwrap();
    assert_eq!(got.opt_geom.energy, Some(-5.070544808316));
    assert_eq!(got.opt_geom.labels(), vec!["O", "H", "H"]);
    assert_abs_diff_eq!(
        got.opt_geom.atoms[1].x,
        0.76375436104419 / BOHR2ANG,
        epsilon = 1e-12
    );
    let log = got.opt_log.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].energy, Some(-5.070544797559));

    let calls = xtb.runner().calcs();
    assert_eq!(calls[0].argv[calls[0].argv.len() - 2..], ["--opt", "tight"]);
    assert!(out.path().join("calculator.000.xtbopt.xyz").exists());
}

#[test]
fn opt_without_log() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb.run_opt(&WATER, &COORDS, false, false).unwrap().unwrap();
    assert!(got.opt_log.is_none());
    assert!(listing(&out).is_empty());
}

#[test]
fn opt_failed() {
    let out = TempDir::new().unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out), Fake::new("opt_failed")).unwrap();
    let got = xtb.run_opt(&WATER, &COORDS, true, false).unwrap();
    assert!(got.is_none());
    assert_eq!(xtb.calc_number(), 1);
    // the failure is reported under the number of the files it kept
    let files = listing(&out);
    assert!(files.contains(&"calculator.000.xtb.out".to_owned()));
    assert!(!files.iter().any(|f| f.ends_with("xtbopt.xyz")));

    let got = xtb.run_opt(&WATER, &COORDS, true, false).unwrap();
    assert!(got.is_none());
    assert_eq!(xtb.calc_number(), 2);
    assert!(listing(&out).contains(&"calculator.001.xtb.out".to_owned()));
}

#[test]
fn md() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let velocities = [1e-4, 0.0, 0.0, -2e-4, 0.0, 3.5e-5, 0.0, 0.0, 0.0];
    let got = xtb
        .run_md(&WATER, &COORDS, 100.0, 0.5, Some(&velocities), 10)
        .unwrap();
    assert_eq!(got.len(), 3);
    assert_eq!(got[2].energy, Some(-5.070530716254));

    let calls = xtb.runner().calcs();
    let call = &calls[0];
    assert_snapshot!(call.xcontrol.clone().unwrap(), @r"
    $md
        dump=10
        hmass=1
        nvt=false
        restart=true
        shake=0
        step=0.5
        time=0.1
        velo=false
    $end
    $write
        json=true
    $end
    ");
    let mdrestart = call.mdrestart.clone().unwrap();
    assert_eq!(mdrestart.lines().count(), 4);
    assert!(mdrestart.starts_with(" -1.0\n"));
    assert_eq!(
        call.argv[call.argv.len() - 3..],
        ["--input", "xcontrol", "--md"]
    );
    assert_eq!(call.argv.iter().filter(|a| *a == "--input").count(), 2);
    assert!(out.path().join("calculator.000.xtb.trj").exists());
}

#[test]
fn md_without_velocities() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    xtb.run_md(&WATER, &COORDS, 1000.0, 1.0, None, 1).unwrap();
    let calls = xtb.runner().calcs();
    let xcontrol = calls[0].xcontrol.clone().unwrap();
    assert!(xcontrol.contains("restart=false"));
    assert!(xcontrol.contains("time=1.0"));
    assert!(xcontrol.contains("step=1.0"));
    assert!(calls[0].mdrestart.is_none());
}

#[test]
fn md_shape_mismatch() {
    let out = TempDir::new().unwrap();
    let mut xtb = Xtb::with_runner(config(&out), Fake::default()).unwrap();
    let got = xtb.run_md(&WATER, &COORDS, 100.0, 0.5, Some(&[0.0; 6]), 1);
    assert_eq!(
        got,
        Err(ProgramError::ShapeMismatch {
            coords: 3,
            velocities: 2
        })
    );
    assert!(xtb.runner().calls.borrow().is_empty());
    assert_eq!(xtb.calc_number(), 0);
}

#[test]
fn md_unfinished() {
    let out = TempDir::new().unwrap();
    let mut xtb =
        Xtb::with_runner(config(&out), Fake::new("md_unfinished")).unwrap();
    let got = xtb.run_md(&WATER, &COORDS, 100.0, 0.5, None, 1);
    assert!(matches!(got, Err(ProgramError::MdNotFinished(_))));
}

#[test]
fn write_mdrestart() {
    let out = TempDir::new().unwrap();
    let xtb = Xtb::new(config(&out)).unwrap();
    let s = xtb.get_mdrestart_str(&[0.0; 3], &[0.0; 3]).unwrap();
    xtb.write_mdrestart(out.path(), &s).unwrap();
    assert_eq!(read_to_string(out.path().join(MDRESTART_FN)).unwrap(), s);
    assert!(xtb.write_mdrestart(out.path(), "Å").is_err());
}

#[test]
fn termination_of_fixture() {
    assert!(check_termination(&fixture("grad").join(OUT_FN)).unwrap());
}

#[test]
fn local_script() {
    let out = TempDir::new().unwrap();
    let script = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("testfiles/fake_xtb.sh")
        .to_string_lossy()
        .to_string();
    let mut xtb = Xtb::new(config(&out).cmd(string!["sh", script])).unwrap();
    let got = xtb.get_forces(&WATER, &COORDS, None).unwrap();
    assert_eq!(got.energy, -5.07054479756);
    let got = xtb.get_hessian(&["H", "H"], &[0.0; 6], None).unwrap();
    assert_eq!(got.energy, -1.036758917307);
    let log = read_to_string(out.path().join("calculator.001.xtb.out")).unwrap();
    assert!(check_termination(&log).unwrap());
}
