//! Guest-visible framebuffer.
//!
//! The guest drives a control window ({enable, mode, resx, resy} plus a
//! 256-entry palette) through trapped 4-byte MMIO accesses, and writes
//! pixels straight into an ordinary anonymous mapping at `FB_PIXEL_ADDR`.
//! A background thread waits for `enable`, opens a window and keeps
//! copying the pixel region into the frame. Pixel reads are deliberately
//! unsynchronised; a torn frame is visually tolerable.

use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use pixels::{Pixels, SurfaceTexture};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::{Window, WindowAttributes, WindowId};

use crate::mmio::{MmioDevice, MmioFault};
use crate::ExitCode;


pub const FB_CONTROL_ADDR: u64 = 0x800;
pub const FB_PALETTE_ADDR: u64 = FB_CONTROL_ADDR + 16;
const FB_WINDOW_END: u64 = FB_PALETTE_ADDR + 256 * 4;

pub const FB_PIXEL_ADDR: u64 = 0x100_0000;
pub const FB_MAX_DIM: u32 = 4096;
pub const FB_PIXEL_BYTES: usize = (FB_MAX_DIM as usize) * (FB_MAX_DIM as usize) * 4;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisplayMode {
    Y8      = 0,
    Indexed = 1,
    Rgb332  = 2,
    Rgb555  = 3,
    Rgb24   = 4,
    Rgba32  = 5,
}


impl DisplayMode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(DisplayMode::Y8),
            1 => Some(DisplayMode::Indexed),
            2 => Some(DisplayMode::Rgb332),
            3 => Some(DisplayMode::Rgb555),
            4 => Some(DisplayMode::Rgb24),
            5 => Some(DisplayMode::Rgba32),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            DisplayMode::Y8 | DisplayMode::Indexed | DisplayMode::Rgb332 => 1,
            DisplayMode::Rgb555 => 2,
            DisplayMode::Rgb24 => 3,
            DisplayMode::Rgba32 => 4,
        }
    }
}


/// Control window plus palette. All fields are atomics: the trap handler
/// stores into them from signal context while the renderer thread polls.
pub struct Framebuffer {
    enable: AtomicU32,
    mode: AtomicU32,
    resx: AtomicU32,
    resy: AtomicU32,
    palette: [AtomicU32; 256],
}


pub static FRAMEBUFFER: Framebuffer = Framebuffer::new();


impl Framebuffer {
    pub const fn new() -> Self {
        Self {
            enable: AtomicU32::new(0),
            mode: AtomicU32::new(0),
            resx: AtomicU32::new(0),
            resy: AtomicU32::new(0),
            palette: [const { AtomicU32::new(0) }; 256],
        }
    }

    /// Back to power-on state, so one process can host several runs.
    pub fn reset(&self) {
        self.enable.store(0, Ordering::Release);
        self.mode.store(0, Ordering::Release);
        self.resx.store(0, Ordering::Release);
        self.resy.store(0, Ordering::Release);
        for entry in &self.palette {
            entry.store(0, Ordering::Release);
        }
    }

    pub fn enabled(&self) -> bool {
        self.enable.load(Ordering::Acquire) != 0
    }

    fn claims(&self, addr: u64, width: u8) -> bool {
        addr >= FB_CONTROL_ADDR && addr + width as u64 <= FB_WINDOW_END
    }

    fn slot(&self, offset: u64) -> &AtomicU32 {
        match offset {
            0x0 => &self.enable,
            0x4 => &self.mode,
            0x8 => &self.resx,
            0xc => &self.resy,
            _ => &self.palette[((offset - 0x10) >> 2) as usize],
        }
    }

    fn palette_snapshot(&self) -> [u32; 256] {
        let mut out = [0u32; 256];
        for (dst, entry) in out.iter_mut().zip(&self.palette) {
            *dst = entry.load(Ordering::Relaxed);
        }
        out
    }
}


impl MmioDevice for Framebuffer {
    fn try_write(&self, addr: u64, width: u8, value: u64) -> Result<bool, MmioFault> {
        if !self.claims(addr, width) {
            return Ok(false);
        }

        if width != 4 {
            return Err(MmioFault::BadWidth { addr, width });
        }
        if addr % 4 != 0 {
            return Err(MmioFault::Misaligned { addr, width });
        }

        self.slot(addr - FB_CONTROL_ADDR).store(value as u32, Ordering::Release);
        Ok(true)
    }

    fn try_read(&self, addr: u64, width: u8) -> Result<Option<u64>, MmioFault> {
        if !self.claims(addr, width) {
            return Ok(None);
        }

        if width != 4 {
            return Err(MmioFault::BadWidth { addr, width });
        }
        if addr % 4 != 0 {
            return Err(MmioFault::Misaligned { addr, width });
        }

        let value = self.slot(addr - FB_CONTROL_ADDR).load(Ordering::Acquire);
        Ok(Some(value as u64))
    }
}


/// The anonymous RW mapping backing the pixel region. Guest stores land
/// here without trapping.
#[cfg(target_os = "linux")]
pub struct PixelRegion {
    base: *mut libc::c_void,
}

#[cfg(target_os = "linux")]
unsafe impl Send for PixelRegion {}

#[cfg(target_os = "linux")]
impl PixelRegion {
    pub fn map() -> Result<Self, crate::Error> {
        let base = unsafe {
            libc::mmap(
                FB_PIXEL_ADDR as *mut libc::c_void,
                FB_PIXEL_BYTES,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE
                    | libc::MAP_ANONYMOUS
                    | libc::MAP_FIXED_NOREPLACE
                    | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if base != FB_PIXEL_ADDR as *mut libc::c_void {
            if base != libc::MAP_FAILED {
                unsafe { libc::munmap(base, FB_PIXEL_BYTES) };
            }
            return Err(crate::Error::Mapping {
                what: "framebuffer pixels",
                addr: FB_PIXEL_ADDR,
                source: std::io::Error::last_os_error(),
            });
        }

        Ok(Self { base })
    }
}

#[cfg(target_os = "linux")]
impl Drop for PixelRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base, FB_PIXEL_BYTES) };
    }
}


/// Expand one frame of guest pixels into the RGBA8888 surface. Packed
/// 32-bit guest values (palette entries, RGBA32 pixels) are little-endian
/// 0xRRGGBBAA.
pub fn blit(mode: DisplayMode, src: &[u8], palette: &[u32; 256], frame: &mut [u8]) {
    let count = frame.len() / 4;
    debug_assert!(src.len() >= count * mode.bytes_per_pixel());

    for i in 0..count {
        let rgba = match mode {
            DisplayMode::Y8 => {
                let v = src[i];
                [v, v, v, 0xff]
            }

            DisplayMode::Indexed => unpack_rgba(palette[src[i] as usize]),

            DisplayMode::Rgb332 => {
                let v = src[i] as u32;
                [
                    (((v >> 5) & 0x7) * 255 / 7) as u8,
                    (((v >> 2) & 0x7) * 255 / 7) as u8,
                    ((v & 0x3) * 255 / 3) as u8,
                    0xff,
                ]
            }

            DisplayMode::Rgb555 => {
                let v = u16::from_le_bytes([src[2 * i], src[2 * i + 1]]) as u32;
                [
                    (((v >> 10) & 0x1f) * 255 / 31) as u8,
                    (((v >> 5) & 0x1f) * 255 / 31) as u8,
                    ((v & 0x1f) * 255 / 31) as u8,
                    0xff,
                ]
            }

            DisplayMode::Rgb24 => [src[3 * i], src[3 * i + 1], src[3 * i + 2], 0xff],

            DisplayMode::Rgba32 => unpack_rgba(u32::from_le_bytes([
                src[4 * i],
                src[4 * i + 1],
                src[4 * i + 2],
                src[4 * i + 3],
            ])),
        };

        frame[4 * i..4 * i + 4].copy_from_slice(&rgba);
    }
}


fn unpack_rgba(px: u32) -> [u8; 4] {
    [(px >> 24) as u8, (px >> 16) as u8, (px >> 8) as u8, px as u8]
}


pub struct RenderHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}


impl RenderHandle {
    pub fn stop_and_join(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.thread.join();
    }
}


/// Start the renderer thread. It spins until the guest raises `enable`
/// (or the handle is stopped), then opens the window.
pub fn spawn(fb: &'static Framebuffer) -> RenderHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let thread = std::thread::spawn(move || renderer_main(fb, &thread_stop));

    RenderHandle { stop, thread }
}


fn renderer_main(fb: &'static Framebuffer, stop: &AtomicBool) {
    while !fb.enabled() {
        if stop.load(Ordering::Acquire) {
            return;
        }
        std::hint::spin_loop();
    }

    let raw_mode = fb.mode.load(Ordering::Acquire);
    let mode = DisplayMode::from_u32(raw_mode).unwrap_or_else(|| {
        eprintln!("framebuffer: unknown display mode {raw_mode}");
        process::exit(ExitCode::FramebufferError as i32);
    });

    let width = fb.resx.load(Ordering::Acquire);
    let height = fb.resy.load(Ordering::Acquire);
    if width == 0 || height == 0 || width > FB_MAX_DIM || height > FB_MAX_DIM {
        eprintln!("framebuffer: bad resolution {width}x{height}");
        process::exit(ExitCode::FramebufferError as i32);
    }

    let mut builder = EventLoop::builder();

    // The renderer is not the main thread; both Linux backends allow that
    // once asked explicitly.
    #[cfg(target_os = "linux")]
    {
        use winit::platform::wayland::EventLoopBuilderExtWayland;
        use winit::platform::x11::EventLoopBuilderExtX11;

        EventLoopBuilderExtX11::with_any_thread(&mut builder, true);
        EventLoopBuilderExtWayland::with_any_thread(&mut builder, true);
    }

    let event_loop = builder.build().unwrap_or_else(|e| {
        eprintln!("framebuffer: could not create event loop: {e}");
        process::exit(ExitCode::FramebufferError as i32);
    });

    log::debug!("framebuffer: {width}x{height}, mode {mode:?}");

    let mut app = App { fb, stop, mode, width, height, gfx: None };
    if let Err(e) = event_loop.run_app(&mut app) {
        eprintln!("framebuffer: event loop failed: {e}");
        process::exit(ExitCode::FramebufferError as i32);
    }
}


struct App<'a> {
    fb: &'static Framebuffer,
    stop: &'a AtomicBool,
    mode: DisplayMode,
    width: u32,
    height: u32,
    gfx: Option<Gfx>,
}


struct Gfx {
    window: &'static Window,
    pixels: Pixels<'static>,
}


impl ApplicationHandler for App<'_> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.gfx.is_some() {
            return;
        }

        // Keep polling so the stop flag is observed even without events.
        event_loop.set_control_flow(ControlFlow::Poll);

        let attrs = WindowAttributes::default()
            .with_title("riscv-harness")
            .with_inner_size(PhysicalSize::new(self.width, self.height));

        let window = match event_loop.create_window(attrs) {
            Ok(w) => w,
            Err(e) => {
                eprintln!("framebuffer: could not create window: {e}");
                process::exit(ExitCode::FramebufferError as i32);
            }
        };

        // The surface borrows the window for the rest of the run.
        let window: &'static Window = Box::leak(Box::new(window));

        let surface = SurfaceTexture::new(self.width, self.height, window);
        let pixels = match Pixels::new(self.width, self.height, surface) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("framebuffer: could not create surface: {e}");
                process::exit(ExitCode::FramebufferError as i32);
            }
        };

        window.request_redraw();
        self.gfx = Some(Gfx { window, pixels });
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::RedrawRequested => {
                if self.stop.load(Ordering::Acquire) {
                    event_loop.exit();
                    return;
                }

                let Some(gfx) = self.gfx.as_mut() else { return };

                let count = (self.width * self.height) as usize;
                let src = unsafe {
                    std::slice::from_raw_parts(
                        FB_PIXEL_ADDR as *const u8,
                        count * self.mode.bytes_per_pixel(),
                    )
                };

                let palette = self.fb.palette_snapshot();
                blit(self.mode, src, &palette, gfx.pixels.frame_mut());

                if let Err(e) = gfx.pixels.render() {
                    eprintln!("framebuffer: render failed: {e}");
                    process::exit(ExitCode::FramebufferError as i32);
                }

                gfx.window.request_redraw();
            }

            WindowEvent::KeyboardInput { event, .. } if event.state == ElementState::Pressed => {
                let quit = match &event.logical_key {
                    Key::Named(NamedKey::Escape) => true,
                    Key::Character(text) => text == "q",
                    _ => false,
                };

                if quit {
                    self.fb.enable.store(0, Ordering::Release);
                    event_loop.exit();
                }
            }

            WindowEvent::CloseRequested => {
                self.fb.enable.store(0, Ordering::Release);
                event_loop.exit();
            }

            _ => (),
        }
    }
}
