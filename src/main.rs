//! Reflector Bridge - 宿主侧音频桥
//!
//! 设计目标：
//! - 客户端看到的播放位置只由 pacer 决定，不受硬件流重建影响
//! - 输出设备变化（耳机插拔、蓝牙断连）时自动重建真实输出流
//! - 所有失败都降级为“没有声音”，不终止连接
//!
//! 连接器和协议解码器在宿主环境中；这里的 `simulate` 命令用模拟设备
//! 驱动若干虚拟连接走完整条路径，并在中途拔出/插回输出设备。

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};

use reflector_bridge::audio::format::SampleFormat;
use reflector_bridge::audio::stats::StatsReport;
use reflector_bridge::audio::timing::{self, PacingClock};
use reflector_bridge::backend::{OutputRoute, PacerConfig, SimulatedBackend};
use reflector_bridge::server::{BridgeConfig, BridgeServer, Client, Request, Response};
use reflector_bridge::session::{RecoveryOutcome, RecoveryPolicy, SessionId};
use reflector_bridge::shm::{SharedBuffer, SharedMemory, SysVSharedMemory};

/// Reflector Bridge - host audio bridge with device-change recovery
#[derive(Parser)]
#[command(name = "reflector-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive virtual connections through a simulated output device
    Simulate(SimulateArgs),

    /// List client sample formats and their wire ordinals
    Formats,
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of concurrent client connections
    #[arg(long, default_value = "2")]
    sessions: usize,

    /// Client sample format
    #[arg(long, value_enum, default_value = "s16le")]
    format: FormatArg,

    /// Channel count
    #[arg(long, default_value = "2")]
    channels: u8,

    /// Sample rate in Hz
    #[arg(long, default_value = "48000")]
    rate: u32,

    /// Negotiated buffer size in frames
    #[arg(long, default_value = "960")]
    buffer_frames: u32,

    /// Frames per client write
    #[arg(long, default_value = "480")]
    period_frames: u32,

    /// Playback length per client in milliseconds
    #[arg(long, default_value = "3000")]
    duration_ms: u64,

    /// Unplug the output device after this many milliseconds
    #[arg(long, default_value = "1000")]
    unplug_at_ms: u64,

    /// Keep the output device unplugged for this many milliseconds
    #[arg(long, default_value = "500")]
    unplug_for_ms: u64,

    /// Use a single real stream per session instead of pacer + mirror
    #[arg(long)]
    no_reflector: bool,

    /// Transfer PCM through System V shared memory
    #[arg(long)]
    shm: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    U8,
    S16le,
    S16be,
    F32le,
    F32be,
}

impl From<FormatArg> for SampleFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::U8 => SampleFormat::U8,
            FormatArg::S16le => SampleFormat::S16LE,
            FormatArg::S16be => SampleFormat::S16BE,
            FormatArg::F32le => SampleFormat::F32LE,
            FormatArg::F32be => SampleFormat::F32BE,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match cli.command {
        Some(Commands::Simulate(ref args)) => simulate(args)?,
        Some(Commands::Formats) => show_formats(),
        None => {
            println!("Reflector Bridge - host audio bridge\n");
            println!("Usage: reflector-bridge simulate [OPTIONS]");
            println!("       reflector-bridge formats");
            println!("\nRun 'reflector-bridge simulate --help' for simulation options.");
            println!("Press Ctrl+C to stop a running simulation");
        }
    }

    Ok(())
}

/// 显示支持的样本格式
fn show_formats() {
    println!("=== Client Sample Formats ===\n");
    for index in 0..=u8::MAX {
        let Some(format) = SampleFormat::from_wire(index) else {
            break;
        };
        let order = match format.byte_order() {
            Some(order) => format!("{:?}", order),
            None => "-".to_string(),
        };
        println!(
            "[{}] {:<6} {} byte(s)  {:<6} {}",
            index,
            format!("{:?}", format),
            format.byte_width(),
            order,
            if format.is_float() { "float" } else { "integer" }
        );
    }
}

/// 一个虚拟连接的结果
struct ClientSummary {
    session: SessionId,
    frames_written: u64,
    position: u32,
    report: StatsReport,
}

/// 模拟运行
fn simulate(args: &SimulateArgs) -> anyhow::Result<()> {
    if args.period_frames == 0 {
        anyhow::bail!("--period-frames must be positive");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let route = OutputRoute::new("speaker");
    let backend = Arc::new(SimulatedBackend::new(
        Arc::clone(&route),
        PacerConfig::default(),
    ));
    let shared_memory: Arc<dyn SharedMemory> = Arc::new(SysVSharedMemory);
    let config = BridgeConfig {
        reflector_mode: !args.no_reflector,
        recovery: RecoveryPolicy::default(),
    };
    let server = Arc::new(BridgeServer::new(
        config,
        backend.clone(),
        Arc::clone(&shared_memory),
    ));

    let format = SampleFormat::from(args.format);
    println!("Reflector Bridge - Simulation");
    println!(
        "{} session(s) | {:?} {}ch {}Hz | buffer {} frames | {} mode{}",
        args.sessions,
        format,
        args.channels,
        args.rate,
        args.buffer_frames,
        if args.no_reflector { "direct" } else { "reflector" },
        if args.shm { " | shared memory" } else { "" }
    );
    println!(
        "Unplug at {} ms for {} ms. Press Ctrl+C to stop.\n",
        args.unplug_at_ms, args.unplug_for_ms
    );

    let workers: Vec<_> = (0..args.sessions)
        .map(|index| {
            let server = Arc::clone(&server);
            let shared_memory = Arc::clone(&shared_memory);
            let running = running.clone();
            let plan = ClientPlan::from_args(args);
            thread::Builder::new()
                .name(format!("client-{}", index))
                .spawn(move || run_client(index as u64, &server, &shared_memory, &plan, &running))
        })
        .collect::<Result<_, _>>()?;

    drive_device_changes(args, &route, &server, &running);

    let mut summaries = Vec::with_capacity(workers.len());
    for worker in workers {
        match worker.join() {
            Ok(Ok(summary)) => summaries.push(summary),
            Ok(Err(e)) => eprintln!("Client failed: {}", e),
            Err(_) => eprintln!("Client thread panicked"),
        }
    }

    for summary in &summaries {
        println!(
            "\n--- Session {} ---\nFrames written: {} | Position: {}",
            summary.session, summary.frames_written, summary.position
        );
        print!("{}", summary.report);
    }
    println!(
        "\nDevice: {} frames played, peak {:.1}%",
        backend.meter().frames_played(),
        backend.meter().peak() as f64 / i32::MAX as f64 * 100.0
    );

    Ok(())
}

/// 按计划拔出/插回输出设备
fn drive_device_changes(
    args: &SimulateArgs,
    route: &Arc<OutputRoute>,
    server: &BridgeServer,
    running: &AtomicBool,
) {
    if args.unplug_at_ms >= args.duration_ms {
        return;
    }
    if !sleep_while_running(Duration::from_millis(args.unplug_at_ms), running) {
        return;
    }

    println!("Unplugging '{}'", route.name());
    route.disconnect();
    let broadcast = server.notify_device_changed();

    sleep_while_running(Duration::from_millis(args.unplug_for_ms), running);
    route.connect("headphones");
    println!("Connected '{}'", route.name());

    let mut outcomes = broadcast.join();
    // 插回时如果恢复已经放弃，再通知一次
    if outcomes
        .iter()
        .any(|(_, outcome)| matches!(outcome, RecoveryOutcome::Exhausted { .. }))
    {
        outcomes = server.notify_device_changed().join();
    }
    for (session, outcome) in outcomes {
        println!("Session {}: {:?}", session, outcome);
    }
}

/// 分段睡眠，返回是否未被中断
fn sleep_while_running(total: Duration, running: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
    false
}

/// 虚拟客户端的播放计划
struct ClientPlan {
    format: SampleFormat,
    channels: u8,
    rate: u32,
    buffer_frames: u32,
    period_frames: u32,
    duration: Duration,
    shm: bool,
}

impl ClientPlan {
    fn from_args(args: &SimulateArgs) -> Self {
        Self {
            format: args.format.into(),
            channels: args.channels,
            rate: args.rate,
            buffer_frames: args.buffer_frames,
            period_frames: args.period_frames,
            duration: Duration::from_millis(args.duration_ms),
            shm: args.shm,
        }
    }

    fn period_bytes(&self) -> usize {
        self.period_frames as usize * self.channels as usize * self.format.byte_width()
    }
}

/// 一个虚拟连接：协商、播放正弦波、断开
fn run_client(
    index: u64,
    server: &BridgeServer,
    shared_memory: &Arc<dyn SharedMemory>,
    plan: &ClientPlan,
    running: &AtomicBool,
) -> anyhow::Result<ClientSummary> {
    let mut client = Client::new(index);
    server.connect(&mut client);
    let session = client
        .session()
        .map(|session| session.id())
        .ok_or_else(|| anyhow::anyhow!("client {} has no session", index))?;

    server.dispatch(
        &client,
        Request::SetParams {
            format: plan.format,
            channels: plan.channels,
            sample_rate: plan.rate,
            buffer_frames: plan.buffer_frames,
        },
    );
    server.dispatch(&client, Request::Prepare);

    // 客户端一侧的共享内存映射
    let mut guest_buffer = if plan.shm {
        let segment = SysVSharedMemory::create_private(plan.period_bytes())?;
        server.dispatch(&client, Request::AttachSharedMemory { segment });
        let buffer = SharedBuffer::map(shared_memory, segment);
        // 两端都已映射，最后一个解除映射后回收
        SysVSharedMemory::remove(segment)?;
        Some(buffer?)
    } else {
        None
    };

    // 每个客户端不同音高，便于区分
    let mut tone = ToneGenerator::new(220.0 * (index + 1) as f32, plan.rate);
    let mut payload = Vec::with_capacity(plan.period_bytes());
    let mut clock = PacingClock::new();
    let period = timing::frames_to_duration(plan.period_frames as u64, plan.rate);
    let started = Instant::now();
    let mut frames_written = 0u64;

    while running.load(Ordering::SeqCst) && started.elapsed() < plan.duration {
        payload.clear();
        tone.fill(plan.format, plan.channels, plan.period_frames, &mut payload);

        let response = match guest_buffer.as_mut() {
            Some(buffer) => {
                let len = buffer.write_at(0, &payload);
                server.dispatch(&client, Request::WriteShared { len })
            }
            None => server.dispatch(&client, Request::Write { payload: &payload }),
        };
        if let Response::Frames(frames) = response {
            frames_written += frames as u64;
        }

        // pacer 背压已经定速；直连模式下由这里定速
        clock.advance_and_wait(period);
    }

    let position = match server.dispatch(&client, Request::Pointer) {
        Response::Position(position) => position,
        _ => 0,
    };
    let report = client
        .session()
        .map(|session| session.stats().report())
        .ok_or_else(|| anyhow::anyhow!("client {} lost its session", index))?;

    server.dispatch(&client, Request::Close);
    server.disconnect(&mut client);

    Ok(ClientSummary {
        session,
        frames_written,
        position,
        report,
    })
}

/// 正弦波发生器
struct ToneGenerator {
    phase: f32,
    step: f32,
}

impl ToneGenerator {
    fn new(frequency: f32, sample_rate: u32) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency / sample_rate.max(1) as f32,
        }
    }

    fn fill(&mut self, format: SampleFormat, channels: u8, frames: u32, out: &mut Vec<u8>) {
        for _ in 0..frames {
            let sample = self.phase.sin() * 0.5;
            for _ in 0..channels {
                format.encode(sample, out);
            }
            self.phase = (self.phase + self.step) % TAU;
        }
    }
}
