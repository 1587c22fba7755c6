use std::process::exit;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::{ArgAction, Parser, Subcommand};
use log::debug;
use serde_json::json;

use msr145::{
    init_logging, interval_ticks, verbosity_level, ActiveMeasurements, AlarmLimit, LimitSettings,
    Msr145, ProtocolVariant, RecordLimit, RecordingEntry, RecordingOptions, Sample, SampleType,
    SessionConfig, StartCondition, TICKS_PER_SECOND,
};

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Parser, Debug)]
#[command(name = "msr145", version, about = "Read and configure MSR145 data loggers")]
struct Args {
    /// Serial port of the logger (e.g., /dev/ttyUSB0)
    port: String,
    /// Firmware protocol generation
    #[arg(long, default_value = "current")]
    protocol: ProtocolVariant,
    /// Stay at 9600 baud for page transfers
    #[arg(long)]
    no_bulk: bool,
    /// Increase log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Serial number, name, clock and recording state
    Status,
    /// Recordings on the device, newest first
    List {
        #[arg(long)]
        max: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Decode the samples of one recording (0 is the newest)
    Extract {
        index: usize,
        #[arg(long)]
        json: bool,
        #[arg(long, default_value = ",")]
        separator: String,
    },
    /// Start a new recording
    Start {
        /// Start at this time (YYYY-MM-DDTHH:MM:SS)
        #[arg(long, value_parser = parse_time, conflicts_with = "button")]
        at: Option<NaiveDateTime>,
        /// Stop at this time
        #[arg(long, value_parser = parse_time, conflicts_with = "button")]
        until: Option<NaiveDateTime>,
        /// Start on a button press
        #[arg(long)]
        button: bool,
        /// Also stop on a button press
        #[arg(long, requires = "button")]
        button_stop: bool,
        /// Overwrite the oldest data when memory is full
        #[arg(long)]
        ring_buffer: bool,
    },
    /// Stop the running recording
    Stop,
    /// Rename the device (up to 12 characters)
    SetName { name: String },
    /// Set the device clock, to the local time if none is given
    SetTime {
        #[arg(value_parser = parse_time)]
        time: Option<NaiveDateTime>,
    },
    /// Configure one of the 8 measurement timers
    SetTimer {
        timer: u8,
        /// Interval in seconds, resolution 1/512 s
        seconds: f64,
        #[arg(long)]
        pressure: bool,
        #[arg(long)]
        humidity: bool,
        #[arg(long)]
        temperature: bool,
        #[arg(long)]
        battery: bool,
        #[arg(long)]
        blink: bool,
    },
    /// Set the recording and alarm limits of one channel (raw device units)
    SetLimit {
        channel: SampleType,
        #[arg(long, default_value = "off")]
        record: RecordLimit,
        #[arg(long, default_value = "off")]
        alarm: AlarmLimit,
        #[arg(long, default_value_t = 0)]
        limit1: u16,
        #[arg(long, default_value_t = 0)]
        limit2: u16,
    },
    /// Disable every limit
    ClearLimits,
    /// Current readings of one or more channels
    Sensors {
        #[arg(required = true, num_args = 1..)]
        channels: Vec<SampleType>,
    },
    /// Send a raw command given as hex bytes
    Raw {
        #[arg(required = true, num_args = 1..=7)]
        bytes: Vec<String>,
        /// Response length including the checksum
        #[arg(long, default_value_t = 8)]
        len: usize,
    },
    /// Erase all recordings
    Format {
        /// Confirm that every recording may be lost
        #[arg(long)]
        yes: bool,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(verbosity_level(args.verbose));

    let mut config = SessionConfig::default().with_variant(args.protocol);
    if args.no_bulk {
        config = config.with_bulk_baud(None);
    }
    debug!("session config: {:?}", config);

    let mut logger = Msr145::open(&args.port, config)
        .with_context(|| format!("failed to open logger on {}", args.port))?;

    match args.command {
        Cmd::Status => status(&mut logger),
        Cmd::List { max, json } => list(&mut logger, max, json),
        Cmd::Extract {
            index,
            json,
            separator,
        } => extract(&mut logger, index, json, &separator),
        Cmd::Start {
            at,
            until,
            button,
            button_stop,
            ring_buffer,
        } => {
            let condition = match (button, button_stop, at.is_some(), until.is_some()) {
                (true, true, _, _) => StartCondition::ButtonStartStop,
                (true, false, _, _) => StartCondition::ButtonStart,
                (_, _, true, true) => StartCondition::TimeStartStop,
                (_, _, true, false) => StartCondition::TimeStart,
                (_, _, false, true) => StartCondition::TimeStop,
                _ => StartCondition::Now,
            };
            let options = RecordingOptions {
                condition,
                start_time: at,
                stop_time: until,
                ring_buffer,
            };
            logger
                .start_recording(&options)
                .context("failed to start recording")?;
            println!("Recording armed ({:?})", condition);
            Ok(())
        }
        Cmd::Stop => {
            logger.stop_recording().context("failed to stop recording")?;
            println!("Recording stopped");
            Ok(())
        }
        Cmd::SetName { name } => {
            logger.set_name(&name).context("failed to set name")?;
            println!("Name set to '{}'", name);
            Ok(())
        }
        Cmd::SetTime { time } => {
            let time = time.unwrap_or_else(|| Local::now().naive_local());
            logger.set_time(&time).context("failed to set clock")?;
            println!("Clock set to {}", time.format(TIME_FORMAT));
            Ok(())
        }
        Cmd::SetTimer {
            timer,
            seconds,
            pressure,
            humidity,
            temperature,
            battery,
            blink,
        } => {
            let mut measurements = ActiveMeasurements::empty();
            measurements.set(ActiveMeasurements::PRESSURE, pressure);
            measurements.set(ActiveMeasurements::HUMIDITY, humidity);
            measurements.set(ActiveMeasurements::TEMPERATURE, temperature);
            measurements.set(ActiveMeasurements::BATTERY, battery);
            logger.set_timer_interval(timer, interval_ticks(seconds)?)?;
            logger.set_timer_measurements(timer, measurements, blink)?;
            println!("Timer {} set", timer);
            Ok(())
        }
        Cmd::SetLimit {
            channel,
            record,
            alarm,
            limit1,
            limit2,
        } => {
            let limits = LimitSettings {
                record,
                alarm,
                limit1,
                limit2,
            };
            logger
                .set_limits(channel, &limits)
                .with_context(|| format!("failed to set limits of {:?}", channel))?;
            println!("Limits of {:?} set", channel);
            Ok(())
        }
        Cmd::ClearLimits => {
            logger.reset_limits()?;
            println!("All limits cleared");
            Ok(())
        }
        Cmd::Sensors { channels } => {
            for (kind, value) in logger.sensor_values(&channels)? {
                println!("{:?}: {}", kind, value);
            }
            Ok(())
        }
        Cmd::Raw { bytes, len } => raw(&mut logger, &bytes, len),
        Cmd::Format { yes } => {
            if !yes {
                bail!("formatting erases every recording, pass --yes to continue");
            }
            logger.format_memory().context("format failed")?;
            println!("Memory formatted");
            Ok(())
        }
    }
}

fn parse_time(s: &str) -> std::result::Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| format!("expected YYYY-MM-DDTHH:MM:SS: {e}"))
}

fn status(logger: &mut Msr145) -> Result<()> {
    let serial = logger.serial_number().context("failed to read serial number")?;
    let names = logger.name_block()?;
    let time = logger.device_time()?;
    let status = logger.status()?;
    let start = logger.start_settings()?;

    println!("Serial:       {}", serial);
    println!("Name:         {}", names.name);
    println!("Calibration:  {}", names.calibration_name);
    println!("Clock:        {}", time.format(TIME_FORMAT));
    println!("Recording:    {}", if status.recording { "yes" } else { "no" });
    println!("Write page:   {:#06X}", status.write_pointer);
    println!(
        "Start mode:   {:?}{}",
        start.condition,
        if start.ring_buffer { " (ring buffer)" } else { "" }
    );
    Ok(())
}

fn list(logger: &mut Msr145, max: Option<usize>, as_json: bool) -> Result<()> {
    let entries = logger
        .list_recordings(max)
        .context("failed to read recording index")?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("No recordings");
    }
    for (index, entry) in entries.iter().enumerate() {
        println!(
            "{:>3}  {}  {:#06X}  {:>5} pages{}",
            index,
            entry.start_datetime().format(TIME_FORMAT),
            entry.start_address,
            entry.length,
            if entry.is_active { "  (recording)" } else { "" }
        );
    }
    Ok(())
}

fn extract(logger: &mut Msr145, index: usize, as_json: bool, separator: &str) -> Result<()> {
    let entry = logger
        .recording(index)
        .with_context(|| format!("no recording {}", index))?;
    let samples = logger
        .samples(&entry)
        .with_context(|| format!("failed to read recording {}", index))?;

    if as_json {
        let rows: Vec<_> = samples
            .iter()
            .map(|s| {
                json!({
                    "time": wall_time(&entry, s).format(TIME_FORMAT).to_string(),
                    "seconds": s.seconds(),
                    "type": s.sample_type,
                    "value": s.value,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("time{0}seconds{0}type{0}value", separator);
    for s in &samples {
        println!(
            "{1}{0}{2:.3}{0}{3:?}{0}{4}",
            separator,
            wall_time(&entry, s).format(TIME_FORMAT),
            s.seconds(),
            s.sample_type,
            s.value
        );
    }
    Ok(())
}

fn wall_time(entry: &RecordingEntry, sample: &Sample) -> NaiveDateTime {
    let micros = sample.timestamp.saturating_mul(1_000_000) / TICKS_PER_SECOND;
    entry.start_datetime() + chrono::Duration::microseconds(micros as i64)
}

fn raw(logger: &mut Msr145, bytes: &[String], len: usize) -> Result<()> {
    let mut command = [0u8; 7];
    for (slot, text) in command.iter_mut().zip(bytes) {
        *slot = parse_hex_byte(text)?;
    }
    let response = logger.raw_command(command, len)?;
    let hex: Vec<String> = response.iter().map(|b| format!("{:02X}", b)).collect();
    println!("{}", hex.join(" "));
    Ok(())
}

fn parse_hex_byte(text: &str) -> Result<u8> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u8::from_str_radix(digits, 16).with_context(|| format!("'{}' is not a hex byte", text))
}
