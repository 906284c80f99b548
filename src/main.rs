// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! rtbridge demo - Mirror a small synth patch onto a simulated audio thread.

use rtbridge::config::{ConfigManager, RealtimeConfig};
use rtbridge::gc::{DeferredCollector, Sweeper};
use rtbridge::realtime::CallQueue;
use rtbridge::tree::{SourceTree, TreeSynchronizer};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Simulated audio block period.
const BLOCK_PERIOD: Duration = Duration::from_millis(5);

/// What the audio thread saw before it stopped.
struct AudioReport {
    blocks: u64,
    generation: u64,
    voices: usize,
    level: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("rtbridge=debug".parse()?))
        .init();

    info!("Starting rtbridge demo");

    let config = load_config();
    let collector = Arc::new(DeferredCollector::with_config(&config.collector));
    let sweeper = Sweeper::spawn(Arc::clone(&collector), config.collector.sweep_interval())?;

    let (producer, mut consumer) = CallQueue::new(config.queue.capacity_bytes).split();
    let mut tree = SourceTree::new("synth");
    let (sync, mut reader) =
        TreeSynchronizer::attach(&mut tree, Rc::new(producer), Arc::clone(&collector));

    let running = Arc::new(AtomicBool::new(true));
    let audio = {
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("audio".to_string())
            .spawn(move || {
                let mut report = AudioReport {
                    blocks: 0,
                    generation: 0,
                    voices: 0,
                    level: 0.0,
                };
                loop {
                    // Pick up the last jobs before leaving
                    let stopping = !running.load(Ordering::Acquire);
                    consumer.drain();

                    let replica = reader.replica();
                    report.blocks += 1;
                    report.generation = replica.generation();
                    if let Some(root) = replica.root() {
                        report.voices = root.num_children();
                        report.level = root
                            .children()
                            .filter_map(|voice| voice.scalar("gain"))
                            .map(|gain| gain.as_f64())
                            .sum();
                    }

                    if stopping {
                        break;
                    }
                    thread::sleep(BLOCK_PERIOD);
                }
                report
            })?
    };

    // Build a patch, then automate it from this thread
    let root = tree.root();
    tree.set_property(root, "name", "demo patch")?;
    let wavetable: Vec<f32> = (0..256)
        .map(|i| (i as f32 / 256.0 * std::f32::consts::TAU).sin())
        .collect();
    tree.set_property(root, "wavetable", collector.register(wavetable).into_shared_object())?;

    let mut voices = Vec::new();
    for (i, freq) in [220.0, 277.18, 329.63].into_iter().enumerate() {
        let voice = tree.add_child(root, "voice", None)?;
        tree.set_property(voice, "index", i as i64)?;
        tree.set_property(voice, "freq", freq)?;
        tree.set_property(voice, "gain", 0.0)?;
        voices.push(voice);
    }

    for step in 1..=100 {
        let gain = f64::from(step) / 100.0;
        for &voice in &voices {
            tree.set_property(voice, "gain", gain / voices.len() as f64)?;
        }
        if step == 50 {
            tree.move_child(root, 0, 2)?;
        }
        thread::sleep(BLOCK_PERIOD / 2);
    }
    tree.remove_child(root, 0)?;

    if sync.needs_resync() && !sync.resync(&tree) {
        warn!("Final resync did not fit in the call queue");
    }

    let stats = sync.stats();
    info!(
        "Synchronizer issued {} fast updates and {} full resyncs ({} dropped)",
        stats.fast_updates, stats.full_resyncs, stats.dropped_jobs
    );

    // Shut down: audio thread first, then the producer side, then the collector
    running.store(false, Ordering::Release);
    let report = audio.join().map_err(|_| "audio thread panicked")?;
    info!(
        "Audio thread ran {} blocks, last replica generation {} with {} voices at level {:.2}",
        report.blocks, report.generation, report.voices, report.level
    );

    drop(sync);
    drop(tree);
    sweeper.stop();

    if let Err(e) = collector.shutdown() {
        error!("{}", e);
        return Err(e.into());
    }

    info!("rtbridge demo finished");
    Ok(())
}

/// Load the config, writing the defaults on first run.
fn load_config() -> RealtimeConfig {
    let manager = match ConfigManager::new() {
        Ok(manager) => manager,
        Err(e) => {
            warn!("No config directory, using defaults: {}", e);
            return RealtimeConfig::default();
        }
    };

    let first_run = !manager.config_path().exists();
    match manager.load_config() {
        Ok(config) => {
            if first_run {
                if let Err(e) = manager.save_config(&config) {
                    warn!("Failed to save default config: {}", e);
                }
            }
            config
        }
        Err(e) => {
            warn!(
                "Failed to load {}, using defaults: {}",
                manager.config_path().display(),
                e
            );
            RealtimeConfig::default()
        }
    }
}
