//! 运行时上下文
//!
//! 线程组之间唯一共享的状态：
//! - 退出标志、状态转储代数（原子变量）
//! - 设备打开串行化锁、转储输出锁
//! - 每个线程组一个自管道唤醒器
//!
//! 信号处理只做两件事：设置原子变量、往管道写一个字节，
//! 真正的工作由各线程组的 poll 循环完成。

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// 非阻塞自管道唤醒器
#[derive(Debug)]
pub struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (read, write) = pipe(libc::O_NONBLOCK | libc::O_CLOEXEC)?;
        Ok(Self { read, write })
    }

    /// 唤醒等待中的 poll（管道已满时忽略）
    pub fn wake(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
            );
        }
    }

    /// 读空管道
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                return total;
            }
            total += n as usize;
        }
    }

    /// poll 使用的读端
    pub fn fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn pipe(flags: libc::c_int) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), flags) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // pipe2 成功后两个描述符归我们所有
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// 设备打开锁守卫
///
/// 启用 serialopen 时持有全局互斥锁，否则为空守卫
pub struct OpenLock<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

/// 运行时上下文（所有线程组共享）
#[derive(Debug)]
pub struct RuntimeContext {
    quit: AtomicBool,
    dump_generation: AtomicU64,
    serial_open: bool,
    open_mutex: Mutex<()>,
    output_mutex: Mutex<()>,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl RuntimeContext {
    pub fn new(serial_open: bool) -> Arc<Self> {
        Arc::new(Self {
            quit: AtomicBool::new(false),
            dump_generation: AtomicU64::new(0),
            serial_open,
            open_mutex: Mutex::new(()),
            output_mutex: Mutex::new(()),
            wakers: Mutex::new(Vec::new()),
        })
    }

    /// 为一个线程组创建并登记唤醒器
    pub fn register_waker(&self) -> io::Result<Arc<Waker>> {
        let waker = Arc::new(Waker::new()?);
        self.wakers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&waker));
        Ok(waker)
    }

    pub fn wake_all(&self) {
        for waker in self.wakers.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            waker.wake();
        }
    }

    /// 请求所有线程组退出
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.wake_all();
    }

    #[inline]
    pub fn should_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    /// 请求一次状态转储
    pub fn request_dump(&self) {
        self.dump_generation.fetch_add(1, Ordering::SeqCst);
        self.wake_all();
    }

    #[inline]
    pub fn dump_generation(&self) -> u64 {
        self.dump_generation.load(Ordering::SeqCst)
    }

    pub fn open_lock(&self) -> OpenLock<'_> {
        OpenLock {
            _guard: self
                .serial_open
                .then(|| self.open_mutex.lock().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// 转储输出锁，避免多个线程组的报告交错
    pub fn output_lock(&self) -> MutexGuard<'_, ()> {
        self.output_mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// 信号处理函数写入的管道写端
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(sig: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// 安装 SIGUSR1（状态转储）和 SIGUSR2（唤醒）处理
///
/// 处理函数只写管道，分发线程读出信号编号后操作上下文
pub fn install_signal_dispatch(ctx: Arc<RuntimeContext>) -> io::Result<JoinHandle<()>> {
    let (read, write) = pipe(libc::O_CLOEXEC)?;
    unsafe {
        let flags = libc::fcntl(write.as_raw_fd(), libc::F_GETFL);
        libc::fcntl(write.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    // 写端在进程生命周期内保持打开
    SIGNAL_FD.store(write.into_raw_fd(), Ordering::SeqCst);

    for sig in [libc::SIGUSR1, libc::SIGUSR2] {
        let ret = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, std::ptr::null_mut())
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    thread::Builder::new()
        .name("signal-dispatch".to_string())
        .spawn(move || {
            let mut byte = 0u8;
            loop {
                let n = unsafe {
                    libc::read(
                        read.as_raw_fd(),
                        &mut byte as *mut u8 as *mut libc::c_void,
                        1,
                    )
                };
                if n < 0 && io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                if n <= 0 {
                    break;
                }
                match byte as libc::c_int {
                    libc::SIGUSR1 => {
                        log::debug!("SIGUSR1: state dump requested");
                        ctx.request_dump();
                    }
                    _ => ctx.wake_all(),
                }
            }
        })
}

/// 将当前线程切换为 SCHED_FIFO 实时调度
///
/// 返回是否成功（通常需要 CAP_SYS_NICE 或 rtprio 限额）
pub fn set_realtime_priority(priority: i32) -> bool {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let result =
        unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result == 0 {
        log::info!("Realtime scheduling enabled (SCHED_FIFO, priority {})", priority);
        true
    } else {
        log::warn!(
            "Failed to set realtime priority {}: {}",
            priority,
            io::Error::from_raw_os_error(result)
        );
        false
    }
}
