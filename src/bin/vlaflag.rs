use clap::ErrorKind::{DisplayHelp, DisplayVersion};
use log::{info, trace};
use std::{env, ffi::OsString, fmt::Debug, time::Instant};
use vlaflag::{
    cli::VlaFlagContext,
    VlaFlagError::{ClapError, DryRun},
};

fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    I: Debug,
{
    let ctx = match VlaFlagContext::from_args(args) {
        Ok(ctx) => ctx,
        Err(DryRun {}) => {
            info!("Dry run. No files will be written.");
            return 0;
        }
        Err(ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    let start = Instant::now();
    match ctx.run() {
        Ok(()) => {
            info!("total duration: {:?}", start.elapsed());
            0
        }
        Err(e) => {
            eprintln!("flagging error: {e}");
            1
        }
    }
}

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    trace!("start main");
    let retcode = main_with_args(env::args());
    trace!("end main");
    std::process::exit(retcode);
}
