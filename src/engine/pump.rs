//! 线程组 poll 循环
//!
//! 一个线程组在一个线程里轮流服务多个会话：
//! 收集所有会话的描述符加上组唤醒管道，poll 一次，然后逐个会话处理。
//! 单个会话失败只影响它自己。

use std::io;
use std::sync::Arc;

use crate::device::{DeviceFactory, PollFd};

use super::runtime::{RuntimeContext, Waker};
use super::session::LoopbackSession;

/// 线程组
pub struct ThreadGroup {
    id: i32,
    ctx: Arc<RuntimeContext>,
    waker: Arc<Waker>,
    factory: Box<dyn DeviceFactory>,
    sessions: Vec<LoopbackSession>,

    fds: Vec<PollFd>,
    /// 每个会话在 `fds` 中的 (起点, 数量)
    spans: Vec<(usize, usize)>,
    last_dump: u64,
}

impl ThreadGroup {
    pub fn new(
        id: i32,
        ctx: Arc<RuntimeContext>,
        factory: Box<dyn DeviceFactory>,
    ) -> io::Result<Self> {
        let waker = ctx.register_waker()?;
        let last_dump = ctx.dump_generation();
        Ok(Self {
            id,
            ctx,
            waker,
            factory,
            sessions: Vec::new(),
            fds: Vec::new(),
            spans: Vec::new(),
            last_dump,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn add(&mut self, session: LoopbackSession) {
        self.sessions.push(session);
    }

    pub fn sessions(&self) -> &[LoopbackSession] {
        &self.sessions
    }

    /// 启动全部会话，返回成功数
    pub fn start_all(&mut self) -> usize {
        let factory = self.factory.as_ref();
        self.sessions
            .iter_mut()
            .filter_map(|session| session.start(factory).ok())
            .count()
    }

    /// 是否还有会话需要调度
    pub fn is_alive(&self) -> bool {
        self.sessions.iter().any(|s| s.is_alive())
    }

    /// poll 超时（毫秒，向上取整），-1 表示无限等待
    fn poll_timeout(&self) -> i32 {
        self.sessions
            .iter()
            .filter(|s| s.is_alive())
            .filter_map(|s| s.wake_hint_usec())
            .min()
            .map_or(-1, |usec| usec.div_ceil(1000).min(i32::MAX as u64) as i32)
    }

    /// 一轮 poll + 服务
    pub fn iterate(&mut self) -> io::Result<()> {
        self.fds.clear();
        self.spans.clear();
        self.fds.push(libc::pollfd {
            fd: self.waker.fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for session in &mut self.sessions {
            let start = self.fds.len();
            let count = session.poll_descriptors(&mut self.fds);
            self.spans.push((start, count));
        }

        let timeout = self.poll_timeout();
        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
            // EINTR 视为空唤醒，照常服务
        }

        if self.fds[0].revents & libc::POLLIN != 0 {
            self.waker.drain();
        }

        let generation = self.ctx.dump_generation();
        if generation != self.last_dump {
            self.last_dump = generation;
            for session in &self.sessions {
                session.dump();
            }
        }

        if self.ctx.should_quit() {
            return Ok(());
        }

        let factory = self.factory.as_ref();
        for (session, &(start, count)) in self.sessions.iter_mut().zip(&self.spans) {
            session.service(factory, &self.fds[start..start + count]);
        }
        Ok(())
    }

    /// 运行到退出请求或没有存活会话，然后关闭全部会话
    pub fn run(&mut self) {
        log::info!(
            "group {}: running {} session(s)",
            self.id,
            self.sessions.len()
        );
        while !self.ctx.should_quit() && self.is_alive() {
            if let Err(e) = self.iterate() {
                log::error!("group {}: poll failed: {}", self.id, e);
                break;
            }
        }
        self.stop_all();
        log::info!("group {}: stopped", self.id);
    }

    pub fn stop_all(&mut self) {
        for session in &mut self.sessions {
            session.stop();
        }
    }
}
