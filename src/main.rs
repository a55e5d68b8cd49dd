use std::env;
use std::f64::consts::TAU;
use std::io::{self, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use emu_audio::driver::simulated::{SimulatedConfig, SimulatedHost};
use emu_audio::mixer::StreamType;
use emu_audio::{AudioConfig, AudioPipeline, DriverRegistry, InputTiming, ResamplerQuality};

const DEFAULT_CORE_RATE: f64 = 32_040.5;
const DEFAULT_FPS: f64 = 60.0988;
const DEFAULT_REFRESH: f64 = 60.0;
const DEFAULT_SECONDS: f64 = 5.0;
const STATUS_UPDATE_MS: u64 = 250;

/// Stand-in for an emulator core: a stereo sine at an odd native rate
struct ToneCore {
    rate: f64,
    fps: f64,
    frequency: f64,
    phase: f64,
    /// Fractional samples carried between video frames
    carry: f64,
}

impl ToneCore {
    fn new(rate: f64, fps: f64, frequency: f64) -> Self {
        ToneCore {
            rate,
            fps,
            frequency,
            phase: 0.0,
            carry: 0.0,
        }
    }

    /// Audio for one video frame, interleaved stereo
    fn run_frame(&mut self, out: &mut Vec<i16>) {
        out.clear();
        let exact = self.rate / self.fps + self.carry;
        let frames = exact.floor() as usize;
        self.carry = exact - frames as f64;

        let step = TAU * self.frequency / self.rate;
        for _ in 0..frames {
            let sample = (self.phase.sin() * 0.25 * 32767.0) as i16;
            out.push(sample);
            out.push(sample);
            self.phase = (self.phase + step) % TAU;
        }
    }
}

struct Options {
    config: AudioConfig,
    core_rate: f64,
    fps: f64,
    refresh: f64,
    seconds: f64,
    tone: f64,
    sfx: Option<String>,
    list_drivers: bool,
    list_devices: bool,
}

fn print_usage() {
    eprintln!(
        "Usage:\n  emu-audio [options]\n\nOptions:\n  --config <file.json>   Load audio settings from JSON\n  --driver <name>        Output driver (see --list-drivers)\n  --device <name>        Output device\n  --rate <hz>            Requested output rate (default 48000)\n  --latency <ms>         Requested latency (default 64)\n  --quality <q>          Resampler: lowest|lower|normal|higher|highest\n  --threaded             Write to the driver from a dedicated thread\n  --nonblock             Drop audio instead of blocking (video-synced)\n  --mute                 Push silence\n  --core-rate <hz>       Synthetic core rate (default {DEFAULT_CORE_RATE})\n  --fps <fps>            Core frame rate (default {DEFAULT_FPS})\n  --refresh <hz>         Display refresh rate (default {DEFAULT_REFRESH})\n  --seconds <s>          Run time (default {DEFAULT_SECONDS})\n  --tone <hz>            Tone frequency (default 440)\n  --sfx <file.wav>       Play a WAV through the mixer on top\n  --list-drivers         List registered drivers\n  --list-devices         List devices of the selected driver\n  -h, --help             Show this help\n\nExamples:\n  emu-audio --driver simulated --seconds 2\n  RUST_LOG=debug emu-audio --nonblock --core-rate 44100 --fps 59.94\n"
    );
}

fn parse_value<T: std::str::FromStr>(flag: &str, value: Option<String>) -> anyhow::Result<T> {
    let value = value.with_context(|| format!("{flag} requires an argument"))?;
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {flag}: {value}"))
}

/// Parse the command line; `None` when only help was requested
fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut config = AudioConfig::low_latency(48_000);
    let mut overrides: Vec<(String, Option<String>)> = Vec::new();
    let mut opts = Options {
        config: AudioConfig::default(),
        core_rate: DEFAULT_CORE_RATE,
        fps: DEFAULT_FPS,
        refresh: DEFAULT_REFRESH,
        seconds: DEFAULT_SECONDS,
        tone: 440.0,
        sfx: None,
        list_drivers: false,
        list_devices: false,
    };

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(None);
            }
            "--config" => {
                let path: String = parse_value(&arg, args.next())?;
                config = AudioConfig::load(&path)
                    .with_context(|| format!("Failed to load config '{path}'"))?;
            }
            "--core-rate" => opts.core_rate = parse_value(&arg, args.next())?,
            "--fps" => opts.fps = parse_value(&arg, args.next())?,
            "--refresh" => opts.refresh = parse_value(&arg, args.next())?,
            "--seconds" => opts.seconds = parse_value(&arg, args.next())?,
            "--tone" => opts.tone = parse_value(&arg, args.next())?,
            "--sfx" => opts.sfx = Some(parse_value(&arg, args.next())?),
            "--list-drivers" => opts.list_drivers = true,
            "--list-devices" => opts.list_devices = true,
            "--threaded" | "--nonblock" | "--mute" => overrides.push((arg, None)),
            "--driver" | "--device" | "--rate" | "--latency" | "--quality" => {
                let value = args.next();
                overrides.push((arg, value));
            }
            _ => {
                print_usage();
                bail!("Unknown flag: {arg}");
            }
        }
    }

    // Command line flags win over the config file regardless of order
    for (flag, value) in overrides {
        match flag.as_str() {
            "--threaded" => config.threaded = true,
            "--nonblock" => config.nonblock = true,
            "--mute" => config.mute = true,
            "--driver" => config.driver = parse_value(&flag, value)?,
            "--device" => config.device = Some(parse_value(&flag, value)?),
            "--rate" => config.output_rate = parse_value(&flag, value)?,
            "--latency" => config.latency_ms = parse_value(&flag, value)?,
            "--quality" => config.resampler_quality = parse_value::<ResamplerQuality>(&flag, value)?,
            _ => {}
        }
    }

    config.validate()?;
    if !(opts.core_rate > 0.0 && opts.fps > 0.0 && opts.seconds >= 0.0) {
        bail!("--core-rate and --fps must be positive, --seconds non-negative");
    }
    opts.config = config;
    Ok(Some(opts))
}

fn main() -> anyhow::Result<()> {
    // Library diagnostics go through `log`; the subscriber picks them up
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(opts) = parse_args()? else {
        return Ok(());
    };

    let mut registry = DriverRegistry::with_defaults();
    SimulatedHost::new(SimulatedConfig::default()).register(&mut registry);

    if opts.list_drivers {
        println!("Drivers:");
        for name in registry.names() {
            println!("  {name}");
        }
        return Ok(());
    }
    if opts.list_devices {
        let devices = registry.device_list(&opts.config.driver)?;
        println!("Devices for \"{}\":", opts.config.driver);
        if devices.is_empty() {
            println!("  (driver does not enumerate devices)");
        }
        for device in devices {
            println!("  {device}");
        }
        return Ok(());
    }

    println!("Emulator Audio Pipeline - Synthetic Core Playback");
    println!("=================================================\n");

    let timing = InputTiming::new(opts.core_rate, opts.fps, opts.refresh, 1);
    let mut pipeline = AudioPipeline::init(&registry, opts.config.clone(), timing)
        .context("Failed to initialize audio")?;

    if let Some(path) = &opts.sfx {
        let slot = pipeline
            .mixer_mut()
            .load_wav(path, StreamType::User)
            .with_context(|| format!("Failed to load '{path}'"))?;
        pipeline.mixer_mut().play_looped(slot);
        println!("Mixer: looping '{path}' in slot {slot}");
    }

    let config = pipeline.config();
    println!("Pipeline Configuration:");
    println!("  Driver:          {}", pipeline.driver_name());
    println!(
        "  Output rate:     {} Hz (requested {} Hz)",
        pipeline.negotiated_rate(),
        config.output_rate
    );
    println!("  Latency:         {} ms", config.latency_ms);
    println!("  Resampler:       {}", config.resampler_quality);
    println!(
        "  Mode:            {}, {}",
        if config.threaded { "threaded" } else { "synchronous" },
        if config.nonblock { "nonblocking" } else { "blocking" }
    );
    println!(
        "  Core timing:     {:.2} Hz @ {:.4} fps (display {:.2} Hz)",
        opts.core_rate, opts.fps, opts.refresh
    );
    println!("  Nominal ratio:   {:.6}\n", pipeline.nominal_ratio());

    let mut core = ToneCore::new(opts.core_rate, opts.fps, opts.tone);
    let total_frames = (opts.seconds * opts.fps).round() as u64;
    let frame_time = Duration::from_secs_f64(1.0 / opts.refresh.max(1.0));
    let nonblock = pipeline.is_nonblock();

    let mut frame = Vec::new();
    let start = Instant::now();
    let mut next_vsync = start;
    let mut last_status = start;

    for _ in 0..total_frames {
        core.run_frame(&mut frame);
        pipeline.push_samples_batch(&frame);

        // Nonblocking audio no longer paces the loop; sync to "vsync" instead
        if nonblock {
            next_vsync += frame_time;
            let now = Instant::now();
            if next_vsync > now {
                std::thread::sleep(next_vsync - now);
            }
        }

        if last_status.elapsed() >= Duration::from_millis(STATUS_UPDATE_MS) {
            last_status = Instant::now();
            let stats = pipeline.stats();
            print!(
                "\x1B[2K\r[{:.1}s] Ratio: {:.6} | Fill: {:>5.1}% | Dropped: {} | Overruns: {}",
                start.elapsed().as_secs_f32(),
                stats.ratio,
                stats.fill * 100.0,
                stats.frames_dropped,
                stats.overrun_count
            );
            io::stdout().flush().ok();
        }

        if !pipeline.is_active() {
            println!();
            bail!("Audio driver died; see log for details");
        }
    }
    println!();

    let total_time = start.elapsed();
    let stats = pipeline.stats();

    println!("\n=== Playback Statistics ===");
    println!("Duration:          {:.2} seconds", total_time.as_secs_f32());
    println!("Frames pushed:     {}", stats.frames_pushed);
    println!("Frames dropped:    {}", stats.frames_dropped);
    println!("Overrun events:    {}", stats.overrun_count);
    println!("Final ratio:       {:.6}", stats.ratio);
    if let Some(buffer) = pipeline.buffer_statistics() {
        println!("Average fill:      {:.1}%", buffer.average_fill);
        println!("Fill deviation:    {:.1}%", buffer.std_deviation);
        println!("Close to underrun: {:.1}%", buffer.close_to_underrun);
        println!("Close to blocking: {:.1}%", buffer.close_to_blocking);
    }
    println!(
        "Buffer size:       {} bytes",
        pipeline.buffer_size()
    );

    pipeline.deinit();
    println!("\nPlayback complete!");
    Ok(())
}
