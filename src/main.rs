// =============================================================================
// LUMEN - Vulkan frame renderer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, window, FPS title)                      │
// │    └── Engine (scene + backend, one frame per redraw)           │
// │          └── RenderBackend (Vulkan)                             │
// │                └── Frame pacer, swapchain, pipelines            │
// │                      └── GraphicsContext (device, allocator)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image
// 3. Record the scene's draws with push descriptors
// 4. Submit, then present
// 5. Rebuild the swapchain if it went stale
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod engine;
mod render;
mod scene;

use anyhow::Result;
use bevy_ecs::entity::Entity;
use config::Config;
use engine::{Engine, Event};
use render::RenderBackend;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = startup(Path::new("config.toml"));
    log::info!("Starting Lumen renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!(
        "Graphics API: {:?}, present mode: {}",
        config.graphics.api,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.fatal.take().map_or(Ok(()), Err)
}

/// Logging first, so problems reading the config are reported
fn startup(config_path: &Path) -> Config {
    init_logging();
    let config = Config::load_or_default(config_path);
    init_log_file(&config);
    config
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    // Keeps the first logger if one is already installed
    let _ = builder.try_init();
}

/// Create/clear the log file that validation errors are appended to
fn init_log_file(config: &Config) {
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Lumen Renderer Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Map a key name from the config to a physical key
fn parse_key(name: &str) -> Option<KeyCode> {
    let key = match name.to_ascii_lowercase().as_str() {
        "escape" | "esc" => KeyCode::Escape,
        "space" => KeyCode::Space,
        "enter" | "return" => KeyCode::Enter,
        "tab" => KeyCode::Tab,
        "f1" => KeyCode::F1,
        "f2" => KeyCode::F2,
        "f3" => KeyCode::F3,
        "f4" => KeyCode::F4,
        "f5" => KeyCode::F5,
        "f6" => KeyCode::F6,
        "f7" => KeyCode::F7,
        "f8" => KeyCode::F8,
        "f9" => KeyCode::F9,
        "f10" => KeyCode::F10,
        "f11" => KeyCode::F11,
        "f12" => KeyCode::F12,
        "q" => KeyCode::KeyQ,
        "f" => KeyCode::KeyF,
        _ => return None,
    };
    Some(key)
}

fn parse_key_or(name: &str, fallback: KeyCode) -> KeyCode {
    parse_key(name).unwrap_or_else(|| {
        log::warn!("Unknown key '{}', using {:?}", name, fallback);
        fallback
    })
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus the engine rendering into it.
///
/// IMPORTANT: Field order matters for Drop! The engine (and every GPU
/// object in it) goes before the window it presents to.
struct App {
    engine: Option<Engine<Box<dyn RenderBackend>>>,
    window: Option<Arc<Window>>,
    config: Config,
    is_fullscreen: bool,
    fullscreen_key: KeyCode,
    quit_key: KeyCode,
    reload_key: KeyCode,

    /// Entity of the model loaded from `config.assets.model`
    model: Option<Entity>,

    /// First unrecoverable error; returned from main after the loop exits
    fatal: Option<anyhow::Error>,

    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let fullscreen_key = parse_key_or(&config.controls.fullscreen_key, KeyCode::F11);
        let quit_key = parse_key_or(&config.controls.quit_key, KeyCode::Escape);
        let reload_key = parse_key_or(&config.controls.reload_key, KeyCode::F5);
        Self {
            engine: None,
            window: None,
            config,
            is_fullscreen,
            fullscreen_key,
            quit_key,
            reload_key,
            model: None,
            fatal: None,
            fps: FpsCounter::new(Instant::now()),
        }
    }

    fn init_engine(&mut self, window: Arc<Window>) -> Result<()> {
        let backend = render::create_backend(window, &self.config)?;
        let mut engine = Engine::new(backend);
        engine.init()?;

        if let Some(path) = &self.config.assets.environment_texture {
            engine.set_environment_texture(path)?;
        }
        self.engine = Some(engine);
        self.reload_model()
    }

    /// (Re)load `config.assets.model`, unloading the previous copy
    fn reload_model(&mut self) -> Result<()> {
        let (Some(engine), Some(path)) = (self.engine.as_mut(), &self.config.assets.model) else {
            return Ok(());
        };
        if let Some(entity) = self.model.take() {
            engine.unload_model(entity)?;
        }

        self.model = engine.load_model(path)?;
        if self.model.is_none() {
            log::warn!("Model {} could not be loaded", path.display());
        }
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The resulting Resized event marks the swapchain stale
        }
    }

    fn show_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(stats) = self.fps.tick(Instant::now()) else {
            return;
        };

        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen {
                "fullscreen"
            } else {
                "windowed"
            };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title, stats.fps, stats.frame_ms, mode
            ));
        }
    }
}

// =============================================================================
// FPS COUNTER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsStats {
    fps: f32,
    frame_ms: f32,
}

/// Counts rendered frames and reports a rate about once per second
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    fn tick(&mut self, now: Instant) -> Option<FpsStats> {
        let frame_time = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let stats = FpsStats {
            fps: self.frames as f32 / elapsed,
            frame_ms: frame_time * 1000.0,
        };
        self.frames = 0;
        self.window_start = now;
        Some(stats)
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        self.window = Some(window.clone());
        if let Err(e) = self.init_engine(window) {
            self.fail(event_loop, e.context("Failed to initialize renderer"));
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                engine.handle_event(Event::CloseRequested);
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                engine.handle_event(Event::Resized {
                    width: size.width,
                    height: size.height,
                });
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => match engine.frame() {
                Ok(true) => self.show_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e.context("Render error")),
            },

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        engine.handle_event(Event::KeyPressed(key));
                        if key == self.quit_key {
                            log::info!("{:?} pressed, exiting...", key);
                            engine.shutdown();
                        } else if key == self.fullscreen_key {
                            self.toggle_fullscreen();
                        } else if key == self.reload_key {
                            if let Err(e) = self.reload_model() {
                                self.fail(event_loop, e.context("Failed to reload model"));
                            }
                        }
                    }
                }
            }

            _ => {}
        }

        if self.engine.as_ref().is_some_and(|e| e.should_quit()) {
            event_loop.exit();
        }
    }

    /// Redraw continuously, but sleep on events while minimized.
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let minimized = self.engine.as_ref().is_some_and(|e| e.is_minimized());
        if minimized {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(engine) = self.engine.as_ref() {
            log::info!("Rendered {} frames", engine.frame_count());
        }
        // Drop GPU state while the window still exists
        self.engine = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fps_reported_once_per_second() {
        use std::time::Duration;

        let start = Instant::now();
        let mut counter = FpsCounter::new(start);
        for i in 1..60 {
            assert_eq!(counter.tick(start + Duration::from_millis(i * 16)), None);
        }

        let stats = counter.tick(start + Duration::from_millis(1000)).unwrap();
        assert_relative_eq!(stats.fps, 60.0, epsilon = 1e-3);
        assert_relative_eq!(stats.frame_ms, 56.0, epsilon = 1e-3);

        // Counting restarts after a report
        assert_eq!(counter.tick(start + Duration::from_millis(1016)), None);
    }

    #[test]
    fn logging_is_live_before_config_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let config = startup(&path);
        // The fallback warning for the broken file had somewhere to go
        assert!(log::log_enabled!(log::Level::Warn));
        assert_eq!(config.controls.reload_key, "F5");
    }

    #[test]
    fn key_names_parse() {
        assert_eq!(parse_key("Escape"), Some(KeyCode::Escape));
        assert_eq!(parse_key("F11"), Some(KeyCode::F11));
        assert_eq!(parse_key("f12"), Some(KeyCode::F12));
        assert_eq!(parse_key("Hyper"), None);
    }

    #[test]
    fn unknown_key_uses_fallback() {
        assert_eq!(parse_key_or("nonsense", KeyCode::F11), KeyCode::F11);
        assert_eq!(parse_key_or("q", KeyCode::Escape), KeyCode::KeyQ);
    }
}
