use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::PathBuf;

mod comtrade;
mod config;
mod error;
mod frame;
mod goose;
mod resample;
mod session;
mod stats;
mod sv;
mod timer;
mod transport;

use config::{default_phasors, Phasor, ReplayConfig, SessionConfig, SourceConfig, CHANNEL_LABELS};
use session::SvSession;
use timer::MonotonicClock;
use transport::RawSocket;

#[derive(Parser, Debug)]
#[command(author, version, about = "IEC 61850-9-2 Sampled Value injector", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish synthetic three-phase phasors.
    Phasor(PhasorArgs),
    /// Replay a COMTRADE recording.
    Replay(ReplayArgs),
    /// Run a session described by a JSON configuration file.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct NetArgs {
    /// Network interface to publish on (requires root).
    #[arg(short, long)]
    interface: String,

    #[arg(long, default_value = "01:0C:CD:01:00:00")]
    dst_mac: String,

    /// Source MAC; auto-detected from the interface when omitted.
    #[arg(long, default_value = "")]
    src_mac: String,

    #[arg(long, default_value_t = 4)]
    vlan_id: u16,

    #[arg(long, default_value_t = 4)]
    vlan_priority: u8,

    /// SV APPID, decimal or 0x-prefixed hex.
    #[arg(long, default_value = "0x4000", value_parser = parse_u16_maybe_hex)]
    app_id: u16,

    #[arg(long, default_value = "TestSV01")]
    sv_id: String,

    /// Output sample rate in Hz.
    #[arg(long, default_value_t = 4800)]
    sample_rate: u16,

    /// Stop when a GOOSE gocbRef contains this substring.
    #[arg(long, default_value = "STOP")]
    goose_trigger: String,

    /// Disable the GOOSE stop listener.
    #[arg(long)]
    no_goose: bool,

    /// Log progress every N packets (0 disables).
    #[arg(long, default_value_t = 1000)]
    progress_interval: u32,
}

#[derive(Args, Debug)]
struct PhasorArgs {
    #[command(flatten)]
    net: NetArgs,

    /// Override one channel as LABEL=MAG@ANGLE, e.g. IA=100@0.
    /// May be repeated; unset channels keep the balanced defaults.
    #[arg(long = "phasor", value_parser = parse_phasor_override)]
    phasors: Vec<(usize, Phasor)>,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    #[command(flatten)]
    net: NetArgs,

    /// COMTRADE .cfg file.
    #[arg(long)]
    cfg: PathBuf,

    /// COMTRADE .dat file; derived from the .cfg path when omitted.
    #[arg(long)]
    dat: Option<PathBuf>,

    /// Map a COMTRADE channel onto an SV channel as NAME=INDEX.
    /// May be repeated.
    #[arg(long = "map", value_parser = parse_channel_map, required = true)]
    mappings: Vec<(String, usize)>,

    /// Restart from the first sample when the recording ends.
    #[arg(long)]
    loop_playback: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON session configuration file.
    #[arg(long)]
    config: PathBuf,
}

fn parse_u16_maybe_hex(s: &str) -> Result<u16, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse::<u16>()
    };
    parsed.map_err(|_| format!("invalid 16-bit value '{}'", s))
}

fn parse_phasor_override(s: &str) -> Result<(usize, Phasor), String> {
    let (label, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected LABEL=MAG@ANGLE, got '{}'", s))?;
    let channel = CHANNEL_LABELS
        .iter()
        .position(|l| l.eq_ignore_ascii_case(label))
        .ok_or_else(|| format!("unknown channel '{}' (expected one of {:?})", label, CHANNEL_LABELS))?;
    let (mag, angle) = value
        .split_once('@')
        .ok_or_else(|| format!("expected MAG@ANGLE, got '{}'", value))?;
    let magnitude: f64 = mag.parse().map_err(|_| format!("invalid magnitude '{}'", mag))?;
    let angle_deg: f64 = angle.parse().map_err(|_| format!("invalid angle '{}'", angle))?;
    Ok((channel, Phasor { magnitude, angle_deg }))
}

fn parse_channel_map(s: &str) -> Result<(String, usize), String> {
    let (name, index) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=INDEX, got '{}'", s))?;
    let index: usize = index.parse().map_err(|_| format!("invalid SV channel index '{}'", index))?;
    Ok((name.to_string(), index))
}

fn build_config(cli: Command) -> Result<SessionConfig> {
    match cli {
        Command::Phasor(args) => {
            let mut phasors = default_phasors();
            for (channel, phasor) in args.phasors {
                phasors[channel] = phasor;
            }
            Ok(apply_net_args(args.net, SourceConfig::Phasors(phasors)))
        }
        Command::Replay(args) => {
            let replay = ReplayConfig {
                cfg_path: args.cfg,
                dat_path: args.dat,
                channel_mapping: args.mappings,
                loop_playback: args.loop_playback,
                start_time_offset: 0.0,
                end_time_offset: 0.0,
            };
            Ok(apply_net_args(args.net, SourceConfig::Replay(replay)))
        }
        Command::Run(args) => {
            let text = std::fs::read_to_string(&args.config)
                .map_err(|e| anyhow!("failed to read {}: {}", args.config.display(), e))?;
            let config: SessionConfig = serde_json::from_str(&text)
                .map_err(|e| anyhow!("failed to parse {}: {}", args.config.display(), e))?;
            Ok(config)
        }
    }
}

fn apply_net_args(net: NetArgs, source: SourceConfig) -> SessionConfig {
    SessionConfig {
        iface: net.interface,
        dst_mac: net.dst_mac,
        src_mac: net.src_mac,
        vlan_id: net.vlan_id,
        vlan_priority: net.vlan_priority,
        app_id: net.app_id,
        sv_id: net.sv_id,
        sample_rate: net.sample_rate,
        goose_trigger: net.goose_trigger,
        enable_goose_monitoring: !net.no_goose,
        progress_interval: net.progress_interval,
        source,
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let cli = Cli::parse();

    let config = build_config(cli.command)?;

    // The replay path tolerates startup work eating into the alignment
    // window; the phasor path locks onto the very next second so parallel
    // publishers line up their smpCnt 0.
    let clock = match &config.source {
        SourceConfig::Phasors(_) => MonotonicClock::new(),
        SourceConfig::Replay(_) => MonotonicClock::with_guard(std::time::Duration::from_millis(500)),
    };

    let mut session: SvSession<RawSocket, MonotonicClock> = SvSession::new(clock);
    session.set_goose_callback(|gocb_ref, st_num, sq_num| {
        info!("GOOSE callback: {} (stNum={}, sqNum={})", gocb_ref, st_num, sq_num);
    });

    let handle = session.stop_handle();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, stopping...");
        handle.stop();
    })?;

    if let Err(err) = session.configure(config) {
        error!("failed to configure session: {}", err);
        std::process::exit(1);
    }
    session.log_configuration();

    info!("starting transmission (Ctrl+C to stop)");
    if let Err(err) = session.run() {
        error!("failed to run session: {}", err);
        std::process::exit(1);
    }

    session.log_statistics();
    Ok(())
}
