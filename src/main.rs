//! pcmloop - PCM 回环工具
//!
//! 把采集设备的音频实时送到播放设备，持续补偿两端时钟漂移。
//! 每个线程组一个线程，组内会话共用一个 poll 循环。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use clap::{ArgAction, Parser};

use pcm_loopback::config::{self, LoopbackConfig, SessionArgs};
use pcm_loopback::device::AlsaFactory;
use pcm_loopback::engine::runtime::{install_signal_dispatch, set_realtime_priority};
use pcm_loopback::engine::{LoopbackSession, RuntimeContext, ThreadGroup};

/// pcmloop - Real-time PCM loopback between a capture and a playback device
#[derive(Parser)]
#[command(name = "pcmloop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Job file with one loopback per line (same options as the command line)
    #[arg(short = 'g', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v info, -vv debug and state dump at start, -vvv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Run group threads with SCHED_FIFO at this priority
    #[arg(long, value_name = "PRIO")]
    realtime: Option<i32>,

    /// Lock ring buffer memory (mlock)
    #[arg(long)]
    mlock: bool,

    #[command(flatten)]
    session: SessionArgs,
}

/// 按线程组归并作业，组号 -1 的作业各占一个线程
fn group_jobs(configs: Vec<LoopbackConfig>) -> Vec<Vec<LoopbackConfig>> {
    let mut shared: BTreeMap<i32, Vec<LoopbackConfig>> = BTreeMap::new();
    let mut groups = Vec::new();
    for config in configs {
        if config.thread_group < 0 {
            groups.push(vec![config]);
        } else {
            shared.entry(config.thread_group).or_default().push(config);
        }
    }
    groups.extend(shared.into_values());
    groups
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut configs = match &cli.config {
        Some(path) => config::load_jobs(path, 0)?,
        None => vec![cli.session.resolve("0")?],
    };
    if configs.is_empty() {
        anyhow::bail!("no loopback jobs defined");
    }
    for config in &mut configs {
        config.verbose = cli.verbose;
        config.mlock = cli.mlock;
    }

    let ctx = RuntimeContext::new(configs.iter().any(|c| c.serial_open));
    {
        let ctx = Arc::clone(&ctx);
        ctrlc::set_handler(move || ctx.request_quit())
            .context("failed to install termination handler")?;
    }
    if let Err(e) = install_signal_dispatch(Arc::clone(&ctx)) {
        log::warn!("SIGUSR1/SIGUSR2 handling unavailable: {}", e);
    }

    let groups = group_jobs(configs);
    let group_count = groups.len();
    let (started_tx, started_rx) = mpsc::channel::<usize>();
    let mut handles = Vec::with_capacity(group_count);

    for (index, jobs) in groups.into_iter().enumerate() {
        let ctx = Arc::clone(&ctx);
        let started_tx = started_tx.clone();
        let realtime = cli.realtime;

        let handle = thread::Builder::new()
            .name(format!("loop-group-{}", index))
            .spawn(move || {
                if let Some(priority) = realtime {
                    set_realtime_priority(priority);
                }

                // 会话在本线程内创建，设备句柄从不跨线程
                let mut group =
                    match ThreadGroup::new(index as i32, Arc::clone(&ctx), Box::new(AlsaFactory)) {
                        Ok(group) => group,
                        Err(e) => {
                            log::error!("group {}: cannot create waker: {}", index, e);
                            let _ = started_tx.send(0);
                            return;
                        }
                    };
                for config in jobs {
                    group.add(LoopbackSession::new(config, Arc::clone(&ctx)));
                }

                let started = group.start_all();
                let _ = started_tx.send(started);
                if started > 0 {
                    group.run();
                } else {
                    group.stop_all();
                }
            })
            .context("failed to spawn group thread")?;
        handles.push(handle);
    }
    drop(started_tx);

    let started: usize = started_rx.iter().take(group_count).sum();
    if started == 0 {
        ctx.request_quit();
    }

    for handle in handles {
        if handle.join().is_err() {
            log::error!("group thread panicked");
        }
    }

    if started == 0 {
        anyhow::bail!("no loopback session could be started");
    }
    Ok(())
}
