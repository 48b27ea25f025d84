use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use crossterm::style::Stylize;

use riscv_harness::{
    testconf, Error, ExitCode, ExitType, Outcome, RegInit, Regs, NUM_REGS, REG_NAMES,
};


/// Runs a statically linked RV64 binary natively, trapping its MMIO.
#[derive(Parser, Debug)]
#[command(name = "riscv-harness", disable_version_flag = true)]
struct Args {
    /// Register initialiser in the form rN=V or name=V; repeatable
    #[arg(short = 'r', value_name = "REGINIT", conflicts_with = "test")]
    reginit: Vec<String>,

    /// Run a unit-test configuration file
    #[arg(short = 't', value_name = "FILE.conf")]
    test: Option<PathBuf>,

    /// Accepted for compatibility; ignored
    #[arg(short = 'p')]
    pixel: bool,

    /// The RV64 executable to run
    #[arg(value_name = "PROGRAM", required_unless_present = "test")]
    program: Option<PathBuf>,
}


fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::HelpDisplayed,
                _ => ExitCode::InitializationError,
            };
            let _ = e.print();
            process::exit(code as i32);
        }
    };

    if args.pixel {
        log::debug!("-p accepted and ignored");
    }

    let result = match (&args.test, &args.program) {
        (Some(conf), _) => run_test(conf),
        (None, Some(program)) => run_binary(program, &args.reginit),
        (None, None) => unreachable!("clap enforces one of -t and PROGRAM"),
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };

    process::exit(code as i32);
}


fn run_binary(path: &Path, raw_inits: &[String]) -> Result<ExitCode, Error> {
    let mut inits = Vec::with_capacity(raw_inits.len());
    for raw in raw_inits {
        inits.push(raw.parse::<RegInit>()?);
    }

    let outcome = execute(path, &inits)?;

    let reason = match outcome.exit {
        ExitType::ExitByMarker => "test marker",
        ExitType::ExitByStatus => "system halt",
        ExitType::InitialCall => "nothing (the guest was never entered)",
    };

    eprintln!("Finished execution!");
    eprintln!("Guest stopped by {reason} after {}", format_elapsed(outcome.elapsed));
    eprintln!("Regs at time of end:");
    dump_regs(&outcome.regs);

    Ok(ExitCode::Success)
}


fn run_test(conf: &Path) -> Result<ExitCode, Error> {
    let config = testconf::load(conf)?;
    let outcome = execute(&config.binary, &config.pre)?;

    let mut mismatches = 0;
    for post in &config.post {
        // x0 postconditions are legal but meaningless.
        if post.reg == 0 {
            continue;
        }

        let got = outcome.regs.read(post.reg as usize);
        if got != post.val {
            println!(
                "{} {} (x{}): expected {:#018x}, got {got:#018x}",
                "MISMATCH".red().bold(),
                REG_NAMES[post.reg as usize].trim(),
                post.reg,
                post.val,
            );
            mismatches += 1;
        }
    }

    print!("{}: ", conf.display());
    if mismatches > 0 {
        println!("{} ({mismatches} mismatched registers)", "FAIL".red().bold());
        Ok(ExitCode::UnitTestFailed)
    } else {
        println!("{}", "PASS".green().bold());
        Ok(ExitCode::Success)
    }
}


#[cfg(all(target_os = "linux", target_arch = "riscv64"))]
fn execute(path: &Path, inits: &[RegInit]) -> Result<Outcome, Error> {
    let image = riscv_harness::loader::Image::load(path)?;
    riscv_harness::runner::run_guest(&image, inits)
}

#[cfg(not(all(target_os = "linux", target_arch = "riscv64")))]
fn execute(_path: &Path, _inits: &[RegInit]) -> Result<Outcome, Error> {
    Err(Error::UnsupportedHost)
}


/// Goes to stderr: stdout belongs to the guest's serial port.
fn dump_regs(regs: &Regs) {
    for i in 0..NUM_REGS / 2 {
        eprintln!(
            "{}={:016x}  {}={:016x}",
            REG_NAMES[i],
            regs.read(i),
            REG_NAMES[i + 16],
            regs.read(i + 16),
        );
    }
}


fn format_elapsed(elapsed: Duration) -> String {
    let ns = elapsed.as_nanos();

    if ns < 1_000 {
        format!("{ns} ns")
    } else if ns < 1_000_000 {
        format!("{:.2} µs", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.2} ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2} s", ns as f64 / 1_000_000_000.0)
    }
}
