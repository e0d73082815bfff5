//! Stream decode pipeline demo
//!
//! Plays a synthetic MJPEG stream through the pipeline: a tokio task stands
//! in for the network receive path, a dedicated thread is the decode
//! context and the main loop is the render context.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use flume::bounded;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, info, warn};

use stream_decode::decode::Codec;
use stream_decode::error::status_of;
use stream_decode::{Config, DecodeUnit, Pipeline};

/// Distinct test-pattern pictures the source cycles through
const PATTERN_FRAMES: u32 = 8;

/// Feed a synthetic stream through the decode pipeline.
#[derive(Parser, Debug)]
#[clap(name = "stream-decode")]
struct Opt {
    /// TOML configuration file
    #[clap(long, short)]
    config: Option<PathBuf>,

    /// Decode units to send before stopping
    #[clap(long, default_value_t = 600)]
    frames: u64,

    /// Largest fragment a decode unit is split into, like a network packet
    #[clap(long = "fragment-size", default_value_t = 1392)]
    fragment_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let opt = Opt::parse();
    info!("Stream decode launching...");

    let mut config = Config::load(opt.config.as_deref())?;
    if config.stream.codec != Codec::Mjpeg {
        warn!(
            "Demo source only produces MJPEG, ignoring configured {:?}",
            config.stream.codec
        );
        config.stream.codec = Codec::Mjpeg;
    }

    let mut pipeline = Pipeline::from_config(&config);
    let capabilities = pipeline.setup(&config.engine_settings())?;
    info!(
        "Capabilities {:#010x}, {} slice(s) per frame, units up to {} bytes",
        capabilities.bits(),
        capabilities.slices(),
        pipeline.staging_capacity().unwrap_or_default()
    );
    let reader = pipeline.reader();

    let patterns = test_patterns(config.stream.width, config.stream.height)?;
    let (tx, rx) = bounded::<DecodeUnit>(4);

    // Network source: one decode unit per frame interval
    let frame_interval = Duration::from_secs_f64(1.0 / config.stream.fps.max(1) as f64);
    let (frames, fragment_size) = (opt.frames, opt.fragment_size);
    let source = tokio::spawn(async move {
        let mut interval = tokio::time::interval(frame_interval);
        for frame_number in 0..frames {
            interval.tick().await;
            let data = patterns[(frame_number % patterns.len() as u64) as usize].clone();
            let unit = DecodeUnit::split(frame_number, data, fragment_size);
            if tx.send_async(unit).await.is_err() {
                warn!("Decode thread gone, stopping source");
                break;
            }
        }
    });

    // Decode context
    let decode = std::thread::Builder::new()
        .name("decode".into())
        .spawn(move || {
            while let Ok(unit) = rx.recv() {
                let result = pipeline.submit_decode_unit(&unit);
                if let Err(e) = &result {
                    debug!("Unit {} status {}: {}", unit.frame_number, status_of(&result), e);
                }
            }
            pipeline.teardown();
        })?;

    // Render context: redraw at display rate, reusing the last picture when
    // nothing new arrived
    let mut refresh = tokio::time::interval(frame_interval);
    let mut last_sequence = 0;
    loop {
        tokio::select! {
            _ = refresh.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        if reader.latest_sequence().is_some_and(|seq| seq != last_sequence) {
            if let Some(picture) = reader.current() {
                let age = picture.meta.decoded_at.elapsed();
                metrics::histogram!("picture_age_us").record(age.as_micros() as f64);
                if picture.sequence() % config.stream.fps.max(1) as u64 == 0 {
                    info!(
                        "Picture {} from slot {} ({}x{}), {:?} since decode",
                        picture.sequence(),
                        picture.slot(),
                        picture.width(),
                        picture.height(),
                        age
                    );
                }
                last_sequence = picture.sequence();
            }
        }

        if decode.is_finished() {
            break;
        }
    }

    source.abort();
    decode
        .join()
        .map_err(|_| eyre!("decode thread panicked"))?;

    info!("Final stats: {:?}", reader.stats());
    info!("Stream decode shutting down");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("stream_decode=debug,info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());

    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

/// Encode a handful of moving-gradient pictures as JPEG
fn test_patterns(width: u32, height: u32) -> Result<Vec<Bytes>> {
    (0..PATTERN_FRAMES)
        .map(|frame| -> Result<Bytes> {
            let shift = frame * 255 / PATTERN_FRAMES;
            let mut rgb = Vec::with_capacity((width * height * 3) as usize);
            for y in 0..height {
                for x in 0..width {
                    rgb.push(((x * 255 / width.max(1)) + shift) as u8);
                    rgb.push((y * 255 / height.max(1)) as u8);
                    rgb.push(shift as u8);
                }
            }

            let mut jpeg = Vec::new();
            JpegEncoder::new_with_quality(&mut jpeg, 75).encode(
                &rgb,
                width,
                height,
                ExtendedColorType::Rgb8,
            )?;
            debug!("Test pattern {} is {} bytes", frame, jpeg.len());
            Ok(Bytes::from(jpeg))
        })
        .collect()
}
