//! Native X11 capture using the MIT-SHM extension for zero-copy grabs.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use mirror_platform::source::{
    is_driver_fault, Frame, FrameSource, PixelFormat, SourceOptions, SourceTier,
};
use xcb::{shm, x};

use crate::cursor;
use crate::scale;

const IDENTITY: &str = "x11-shm (native)";

pub struct X11ShmSource {
    conn: xcb::Connection,
    root: x::Window,
    width: u32,
    height: u32,
    target: Option<(u32, u32)>,
    draw_cursor: bool,
    shmseg: shm::Seg,
    shm_ptr: *mut u8,
    shm_size: usize,
    fps: u32,
    last_grab: Instant,
    closed: bool,
}

// SAFETY: the SHM pointer is only dereferenced from &mut methods, and the
// xcb connection is used serially from the owning engine.
unsafe impl Send for X11ShmSource {}

impl X11ShmSource {
    pub fn open(opts: &SourceOptions) -> Result<Self> {
        let (conn, screen_num) =
            xcb::Connection::connect(None).context("failed to connect to X11 display")?;

        let setup = conn.get_setup();
        let screen = setup
            .roots()
            .nth(screen_num as usize)
            .context("no X11 screen found")?;

        let width = u32::from(screen.width_in_pixels());
        let height = u32::from(screen.height_in_pixels());
        let root = screen.root();

        let cookie = conn.send_request(&shm::QueryVersion {});
        conn.wait_for_reply(cookie)
            .context("X11 SHM extension not available")?;

        let shm_size = (width * height * 4) as usize;
        let shm_id = unsafe { libc::shmget(libc::IPC_PRIVATE, shm_size, libc::IPC_CREAT | 0o600) };
        if shm_id < 0 {
            bail!("shmget failed: {}", std::io::Error::last_os_error());
        }

        let ptr = unsafe { libc::shmat(shm_id, std::ptr::null(), 0) };
        if ptr == (-1isize) as *mut libc::c_void {
            unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };
            bail!("shmat failed: {}", std::io::Error::last_os_error());
        }
        // Mark for removal on last detach.
        unsafe { libc::shmctl(shm_id, libc::IPC_RMID, std::ptr::null_mut()) };

        let shmseg: shm::Seg = conn.generate_id();
        let attach = conn.send_and_check_request(&shm::Attach {
            shmseg,
            shmid: shm_id as u32,
            read_only: false,
        });
        if let Err(e) = attach {
            unsafe { libc::shmdt(ptr) };
            return Err(e).context("xcb shm attach failed");
        }

        tracing::info!("native X11 capture ready: {}x{}", width, height);

        Ok(Self {
            conn,
            root,
            width,
            height,
            target: opts.resolution,
            draw_cursor: opts.draw_cursor,
            shmseg,
            shm_ptr: ptr as *mut u8,
            shm_size,
            fps: opts.target_fps.clamp(1, 120),
            last_grab: Instant::now() - Duration::from_secs(1),
            closed: false,
        })
    }

    fn grab(&mut self) -> Result<Vec<u8>> {
        let cookie = self.conn.send_request(&shm::GetImage {
            drawable: x::Drawable::Window(self.root),
            x: 0,
            y: 0,
            width: self.width as u16,
            height: self.height as u16,
            plane_mask: u32::MAX,
            format: x::ImageFormat::ZPixmap as u8,
            shmseg: self.shmseg,
            offset: 0,
        });
        self.conn
            .wait_for_reply(cookie)
            .context("shm get_image failed")?;

        // The reply data landed in the shared segment; BGRA, no row padding.
        let mut data =
            unsafe { std::slice::from_raw_parts(self.shm_ptr, self.shm_size) }.to_vec();

        if self.draw_cursor {
            if let Some((cx, cy)) = self.pointer_position() {
                cursor::overlay_cursor(&mut data, self.width, self.height, self.width * 4, 4, cx, cy);
            }
        }

        Ok(data)
    }

    fn pointer_position(&self) -> Option<(i32, i32)> {
        let cookie = self.conn.send_request(&x::QueryPointer { window: self.root });
        let reply = self.conn.wait_for_reply(cookie).ok()?;
        if !reply.same_screen() {
            return None;
        }
        Some((i32::from(reply.root_x()), i32::from(reply.root_y())))
    }

    fn cleanup_shm(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .conn
            .send_and_check_request(&shm::Detach { shmseg: self.shmseg });
        if !self.shm_ptr.is_null() {
            unsafe { libc::shmdt(self.shm_ptr as *const libc::c_void) };
            self.shm_ptr = std::ptr::null_mut();
        }
    }
}

impl Drop for X11ShmSource {
    fn drop(&mut self) {
        self.cleanup_shm();
    }
}

#[async_trait]
impl FrameSource for X11ShmSource {
    async fn next_frame(&mut self) -> Result<Frame> {
        if self.closed {
            bail!("capture source is closed");
        }

        let interval = Duration::from_secs_f64(1.0 / self.fps.max(1) as f64);
        if let Some(wait) = interval.checked_sub(self.last_grab.elapsed()) {
            tokio::time::sleep(wait).await;
        }

        let mut retried = false;
        let data = loop {
            match self.grab() {
                Ok(data) => break data,
                Err(e) => {
                    let msg = format!("{e:#}");
                    if !retried && is_driver_fault(&msg) {
                        retried = true;
                        tracing::warn!("transient capture fault, retrying: {msg}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        };
        self.last_grab = Instant::now();

        let mut frame = Frame::tight(self.width, self.height, PixelFormat::Bgra, data);
        if let Some((tw, th)) = self.target {
            frame = scale::resize_frame(frame, tw, th);
        }
        Ok(frame)
    }

    fn set_target_fps(&mut self, fps: u32) {
        self.fps = fps.clamp(1, 120);
    }

    fn identity(&self) -> &str {
        IDENTITY
    }

    fn tier(&self) -> SourceTier {
        SourceTier::Native
    }

    async fn close(&mut self) {
        self.cleanup_shm();
    }
}
