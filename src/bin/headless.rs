use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use cathode_core::{AudioQueue, Config, Nes};
use sha1::{Digest, Sha1};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone)]
struct Args {
    rom: Option<PathBuf>,
    frames: u32,
    config: Option<PathBuf>,
    dump_frame: bool,
    verbose: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 60,
            config: None,
            dump_frame: false,
            verbose: false,
        }
    }
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut argv = std::env::args().skip(1);

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--rom" => {
                let value = argv
                    .next()
                    .context("--rom requires a path, e.g. --rom game.nes")?;
                args.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = argv
                    .next()
                    .context("--frames requires an integer, e.g. --frames 60")?;
                args.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--config" => {
                let value = argv
                    .next()
                    .context("--config requires a path, e.g. --config cathode.json")?;
                args.config = Some(PathBuf::from(value));
            }
            "--dump-frame" => args.dump_frame = true,
            "--verbose" | "-v" => args.verbose = true,
            "--help" | "-h" => {
                println!(
                    "headless\n\n\
Usage:\n\
  cargo run --release --bin headless -- --rom <path> [options]\n\n\
Options:\n\
  --rom <path>          iNES ROM to run\n\
  --frames <n>          Frames to run (default 60)\n\
  --config <path>       JSON configuration file\n\
  --dump-frame          Print the final frame as base64 RGB\n\
  -v, --verbose         Debug logging\n\
  -h, --help            Show this help\n"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(args)
}

fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config
            .log_level
            .parse::<Level>()
            .with_context(|| format!("invalid log_level: {}", config.log_level))?
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logger")?;
    Ok(())
}

fn hash_frame(frame_rgb: &[u8]) -> String {
    let digest = Sha1::digest(frame_rgb);
    BASE64_STANDARD.encode(digest)
}

fn main() -> Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_logging(&config, args.verbose)?;

    let rom = args.rom.as_ref().context("--rom is required")?;
    let queue = Arc::new(AudioQueue::from_config(&config)?);
    let mut nes = Nes::with_config(&config);
    nes.attach_audio(Arc::clone(&queue));
    nes.load_game(rom)?;
    info!(rom = %rom.display(), mapper = nes.mapper_name(), "running {} frames", args.frames);

    let start = Instant::now();
    let channels = queue.channels() as usize;
    let mut pcm = Vec::new();
    let mut samples = 0usize;
    for _ in 0..args.frames {
        nes.tick();
        // Stand in for the audio callback and drain what the frame produced.
        pcm.resize(queue.len(), 0);
        queue.pop_samples(&mut pcm);
        samples += pcm.len() / channels;
    }
    let elapsed = start.elapsed();

    println!("rom: {}", rom.display());
    println!("mapper: {}", nes.mapper_name());
    println!("frames: {}", nes.frame_count());
    println!(
        "audio samples: {samples} @ {} Hz, {} channel(s)",
        queue.sample_rate(),
        queue.channels()
    );
    println!("frame sha1: {}", hash_frame(nes.framebuffer()));
    println!(
        "elapsed: {:.3}s ({:.1} fps)",
        elapsed.as_secs_f64(),
        args.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    if args.dump_frame {
        println!("frame rgb: {}", BASE64_STANDARD.encode(nes.framebuffer()));
    }

    Ok(())
}
