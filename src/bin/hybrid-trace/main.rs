//! hybrid-trace CLI - inspect the GPU, render and benchmark the hybrid engine.

use std::env;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use hybrid_trace::prelude::*;

const BUILD_DATE: &str = env!("HYBRID_TRACE_BUILD_DATE");
const BUILD_TIME: &str = env!("HYBRID_TRACE_BUILD_TIME");

/// Parsed command line.
struct Options {
    command: String,
    level: &'static str,
    config: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
    samples: Option<u32>,
    steps: Option<u32>,
    interval_ms: Option<u64>,
    mode: Option<SelectionMode>,
    backend: Option<BackendKind>,
}

fn main() {
    let opts = match parse_args(env::args().skip(1).collect()) {
        Ok(Some(opts)) => opts,
        Ok(None) => {
            print_help();
            return;
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!();
            print_help();
            std::process::exit(1);
        }
    };

    let _guard = init_tracing(opts.level);
    if let Err(e) = run(&opts) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn parse_args(args: Vec<String>) -> Result<Option<Options>> {
    let mut opts = Options {
        command: String::new(),
        level: "info",
        config: None,
        width: None,
        height: None,
        samples: None,
        steps: None,
        interval_ms: None,
        mode: None,
        backend: None,
    };

    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("missing value for {name}"));
        match arg.as_str() {
            "-v" | "--verbose" => opts.level = "debug",
            "-vv" | "--trace" => opts.level = "trace",
            "-q" | "--quiet" => opts.level = "warn",
            "-w" | "--width" => opts.width = Some(value("--width")?.parse().context("--width")?),
            "-H" | "--height" => opts.height = Some(value("--height")?.parse().context("--height")?),
            "-s" | "--samples" => opts.samples = Some(value("--samples")?.parse().context("--samples")?),
            "--steps" => opts.steps = Some(value("--steps")?.parse().context("--steps")?),
            "--interval" => opts.interval_ms = Some(value("--interval")?.parse().context("--interval")?),
            "-m" | "--mode" => opts.mode = Some(value("--mode")?.parse()?),
            "-b" | "--backend" => opts.backend = Some(value("--backend")?.parse()?),
            "-c" | "--config" => opts.config = Some(PathBuf::from(value("--config")?)),
            "help" | "h" | "-h" | "--help" => return Ok(None),
            "--version" | "-V" => {
                println!("hybrid-trace {} (built {BUILD_DATE} {BUILD_TIME})", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other if other.starts_with('-') => bail!("unknown option '{other}'"),
            other if opts.command.is_empty() => opts.command = other.to_string(),
            other => bail!("unexpected argument '{other}'"),
        }
    }
    if opts.command.is_empty() {
        return Ok(None);
    }
    Ok(Some(opts))
}

fn print_help() {
    println!("hybrid-trace - hybrid GPU/CPU path tracing engine");
    println!();
    println!("USAGE:");
    println!("    hybrid-trace [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    i, info          Show backend, hardware profile and capabilities");
    println!("    r, render        Render once on the backend the selector picks");
    println!("    p, progressive   Progressive GPU render driven from a main loop");
    println!("    b, bench         Render on GPU and CPU, compare and teach the selector");
    println!("    h, help          Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -w, --width <N>       Image width");
    println!("    -H, --height <N>      Image height");
    println!("    -s, --samples <N>     Samples per pixel (progressive target)");
    println!("        --steps <N>       Progressive steps");
    println!("        --interval <MS>   Minimum time between progressive dispatches");
    println!("    -m, --mode <MODE>     adaptive | performance | gpu | cpu");
    println!("    -b, --backend <KIND>  auto | software | null | wgpu");
    println!("    -c, --config <FILE>   Config file (default: per-user config dir)");
    println!("    -v, --verbose         Debug output");
    println!("    -vv, --trace          Trace output (very verbose)");
    println!("    -q, --quiet           Warnings and errors only");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG              Log filter, overrides -v/-q");
    println!("    HYBRID_TRACE_BACKEND  Backend override");
    println!("    HYBRID_TRACE_MODE     Selector mode override");
    println!("    HYBRID_TRACE=1        Write trace.json (needs the 'trace' feature)");
    println!();
    println!("Built {BUILD_DATE} {BUILD_TIME}");
}

#[cfg(feature = "trace")]
type TraceGuard = Option<tracing_chrome::FlushGuard>;
#[cfg(not(feature = "trace"))]
type TraceGuard = ();

/// fmt subscriber filtered by `RUST_LOG` (or `level`), plus a Chrome trace
/// layer when built with `trace` and `HYBRID_TRACE=1`.
fn init_tracing(level: &str) -> TraceGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr);

    #[cfg(feature = "trace")]
    if env::var("HYBRID_TRACE").ok().as_deref() == Some("1") {
        let (chrome, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
        let _ = tracing_subscriber::registry().with(filter).with(fmt).with(chrome).try_init();
        return Some(guard);
    }

    let _ = tracing_subscriber::registry().with(filter).with(fmt).try_init();
    #[cfg(feature = "trace")]
    return None;
}

fn load_config(opts: &Options) -> Result<EngineConfig> {
    let mut cfg = match &opts.config {
        Some(path) => {
            let mut cfg = EngineConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?;
            cfg.apply_env();
            cfg
        }
        None => EngineConfig::load(),
    };
    if let Some(w) = opts.width {
        cfg.render.width = w;
    }
    if let Some(h) = opts.height {
        cfg.render.height = h;
    }
    if let Some(s) = opts.samples {
        cfg.render.samples = s;
        cfg.scheduler.target_samples = s;
    }
    if let Some(n) = opts.steps {
        cfg.scheduler.total_steps = n;
    }
    if let Some(ms) = opts.interval_ms {
        cfg.scheduler.update_interval_ms = ms;
    }
    if let Some(mode) = opts.mode {
        cfg.selector.mode = mode;
    }
    if let Some(kind) = opts.backend {
        cfg.render.backend = kind;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run(opts: &Options) -> Result<()> {
    let cfg = load_config(opts)?;
    let settings = RenderSettings::from(&cfg.render);
    let camera = Camera::demo(settings.aspect());
    let scene = Scene::demo();

    match opts.command.as_str() {
        "info" | "i" => cmd_info(cfg),
        "render" | "r" => cmd_render(cfg, &scene, &camera, &settings),
        "progressive" | "p" => cmd_progressive(cfg, &scene, &camera, &settings),
        "bench" | "b" => cmd_bench(cfg, &scene, &camera, &settings),
        other => bail!("unknown command '{other}'"),
    }
}

fn cmd_info(cfg: EngineConfig) -> Result<()> {
    let engine = HybridEngine::from_config(cfg)?;
    let ctx = engine.context();
    println!("Backend:  {}", ctx.backend_name());
    println!("Adapter:  {}", ctx.adapter_info());
    let caps = ctx.capabilities();
    println!(
        "Caps:     compute={} storage={} mapping={} timestamps={}",
        caps.compute_shaders, caps.storage_buffers, caps.buffer_mapping, caps.timestamp_queries
    );
    let l = ctx.limits();
    println!(
        "Limits:   group size {:?}, invocations {}, group count {:?}, storage {} MB",
        l.max_work_group_size,
        l.max_invocations,
        l.max_work_group_count,
        l.max_storage_buffer_size >> 20
    );
    println!();
    print!("{}", engine.report());
    Ok(())
}

fn cmd_render(cfg: EngineConfig, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<()> {
    let mut engine = HybridEngine::from_config(cfg)?;
    let out = engine.render(scene, camera, settings)?;
    println!(
        "{}x{} @ {} spp on {} in {:.2} ms ({})",
        out.width, out.height, settings.samples, out.backend, out.elapsed_ms, out.decision.reason
    );
    println!("Mean luminance: {:.4}", mean_luminance(&out.pixels));
    Ok(())
}

fn cmd_progressive(cfg: EngineConfig, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<()> {
    let mut engine = HybridEngine::from_config(cfg)?;
    let start = Instant::now();
    match engine.start_progressive(scene, camera, settings)? {
        Backend::Gpu => {
            let mut frames = 0u32;
            let mut sink = |px: &[f32], w: u32, h: u32, current: u32, target: u32| {
                frames += 1;
                println!(
                    "  [{:>6.1} ms] {w}x{h} {current}/{target} spp, mean {:.4}",
                    start.elapsed().as_secs_f64() * 1000.0,
                    mean_luminance(px)
                );
            };
            let mut ticks = 0u64;
            while engine.scheduler().is_active() {
                ticks += 1;
                engine.tick(&mut sink)?;
                // Main loop stand-in: the rest of the frame would run here.
                std::thread::sleep(Duration::from_millis(1));
            }
            println!(
                "{} after {ticks} ticks, {frames} frames, {:.1} ms",
                engine.scheduler().status(),
                start.elapsed().as_secs_f64() * 1000.0
            );
        }
        Backend::Cpu => {
            println!("GPU not selected, rendering on the CPU worker");
            loop {
                match engine.poll_cpu_render() {
                    Some(hybrid_trace::render::WorkerResult::Progress { rows, height, .. }) => {
                        tracing::debug!(rows, height, "cpu progress");
                    }
                    Some(hybrid_trace::render::WorkerResult::Finished { pixels, elapsed, .. }) => {
                        println!("Finished in {:.1} ms, mean {:.4}", elapsed.as_secs_f64() * 1000.0, mean_luminance(&pixels));
                        break;
                    }
                    Some(other) => bail!("cpu render ended: {other:?}"),
                    None => std::thread::sleep(Duration::from_millis(5)),
                }
            }
        }
    }
    Ok(())
}

fn cmd_bench(cfg: EngineConfig, scene: &Scene, camera: &Camera, settings: &RenderSettings) -> Result<()> {
    let mut engine = HybridEngine::from_config(cfg)?;
    let bench = engine.benchmark(scene, camera, settings)?;
    println!("CPU: {:.2} ms", bench.cpu_ms);
    match bench.gpu_ms {
        Some(ms) => println!("GPU: {ms:.2} ms, speedup {:.2}x", bench.measurement.speedup),
        None => println!("GPU: unavailable ({})", engine.gpu_error().unwrap_or("render failed")),
    }
    if let Some(d) = bench.max_difference {
        println!("Max pixel difference: {d:.2e}");
    }
    let chars = scene.characteristics(settings.width, settings.height, settings.samples);
    let decision = engine.selector().decide(&chars);
    println!("Selector now picks {} ({})", decision.backend, decision.reason);
    println!();
    print!("{}", engine.report());
    Ok(())
}

fn mean_luminance(rgba: &[f32]) -> f32 {
    let n = (rgba.len() / 4).max(1) as f32;
    rgba.chunks_exact(4)
        .map(|p| 0.2126 * p[0] + 0.7152 * p[1] + 0.0722 * p[2])
        .sum::<f32>()
        / n
}
