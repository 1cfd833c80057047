use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use scopeloop::{
    handoff, AcqError, Acquisition, AcquisitionMode, CaptureWriter, Conf, DeviceSession,
    DwfInstrument, Instrument, LoopEvent, Scope, SimSettings, SimulatedInstrument,
};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};
use std::{fs::File, path::PathBuf, time::Duration};
use time::{macros::format_description, OffsetDateTime};

/// Analog Discovery 2 oscilloscope acquisition.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, default_value = "scope.toml")]
    config: PathBuf,
    /// Use the built-in simulated instrument instead of the WaveForms runtime
    #[arg(long)]
    simulate: bool,
    /// Capture without the terminal UI and write every capture to CSV
    #[arg(long)]
    headless: bool,
    /// Captures to take in headless mode
    #[arg(long, default_value_t = 1)]
    count: u64,
    /// Log file used while the terminal UI is active
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Print a commented configuration template and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!(
            "{}",
            confique::toml::template::<Conf>(confique::toml::FormatOptions::default())
        );
        return Ok(());
    }

    init_logging(&args)?;
    let conf = Conf::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if args.simulate {
        run(SimulatedInstrument::new(SimSettings::default()), conf, &args)
    } else {
        run(DwfInstrument::load()?, conf, &args)
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    if args.headless {
        TermLogger::init(
            LevelFilter::Info,
            config,
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )?;
    } else {
        let path = match &args.log_file {
            Some(path) => path.clone(),
            None => {
                let stamp = OffsetDateTime::now_utc()
                    .format(format_description!("[year][month][day]_[hour][minute][second]"))?;
                PathBuf::from(format!("scopeloop_{stamp}.log"))
            }
        };
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        WriteLogger::init(LevelFilter::Debug, config, file)?;
    }
    Ok(())
}

fn run<I: Instrument + Send + 'static>(instrument: I, conf: Conf, args: &Args) -> Result<()> {
    let session = DeviceSession::open(instrument)?;
    let acq = Acquisition::new(
        session,
        conf.channels.clone(),
        conf.acquisition.clone(),
        conf.acq_loop.settings(),
    )?;
    let writer = CaptureWriter::new(&conf.output.output_dir)
        .with_context(|| format!("creating {}", conf.output.output_dir))?;

    if args.headless {
        return headless(acq, writer, args.count);
    }

    let mut scope = Scope::new(acq, writer);
    let mut terminal = ratatui::init();
    let result = scope.run(&mut terminal);
    ratatui::restore();
    result
}

fn headless<I: Instrument + Send + 'static>(
    mut acq: Acquisition<I>,
    writer: CaptureWriter,
    count: u64,
) -> Result<()> {
    let mode = if count > 1 {
        AcquisitionMode::Continuous
    } else {
        AcquisitionMode::Single
    };
    let (sink, captures) = handoff(acq.settings().handoff_capacity);
    let events = acq.events();
    acq.start(mode, sink)?;

    let mut written = 0;
    let mut last_error: Option<AcqError> = None;
    while written < count {
        if let Some(capture) = captures.recv_timeout(Duration::from_millis(100)) {
            writer.write(&capture)?;
            written += 1;
            continue;
        }
        for event in events.try_iter() {
            if let LoopEvent::Error(e) = event {
                last_error = Some(e);
            }
        }
        // Captures are handed off before the worker exits.
        if !acq.is_running() && captures.pending() == 0 {
            break;
        }
    }

    acq.close()?;
    if captures.dropped() > 0 {
        warn!("{} capture(s) dropped while writing", captures.dropped());
    }
    info!("Wrote {} capture(s) to {}", written, writer.dir().display());
    if written < count {
        let err = anyhow!("only {written} of {count} capture(s) taken");
        return Err(match last_error {
            Some(e) => err.context(e),
            None => err,
        });
    }
    Ok(())
}
