//! Window management using winit

use crate::backend::traits::{BackendError, BackendResult};
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

/// Size and lifecycle flags tracked from window events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub width: u32,
    pub height: u32,
    resized: bool,
    close_requested: bool,
}

impl WindowState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resized: false,
            close_requested: false,
        }
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    /// Return the new size once per resize burst
    pub fn take_resize(&mut self) -> Option<(u32, u32)> {
        if std::mem::take(&mut self.resized) {
            Some((self.width, self.height))
        } else {
            None
        }
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }
}

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    state: WindowState,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| BackendError::SurfaceCreationFailed(format!("window: {}", e)))?;

        let size = window.inner_size();
        Ok(Self {
            window: Arc::new(window),
            state: WindowState::new(size.width, size.height),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.state.width, self.state.height)
    }

    pub fn state(&self) -> &WindowState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut WindowState {
        &mut self.state
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

impl HasWindowHandle for Window {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for Window {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

/// Drive the event loop, calling `frame` once per iteration until it returns
/// `Ok(false)` or fails.
///
/// A close request is only recorded; `frame` sees it through
/// [`WindowState::should_close`] and can release GPU objects before exiting.
pub fn run<F>(event_loop: EventLoop<()>, mut window: Window, mut frame: F) -> BackendResult<()>
where
    F: FnMut(&mut Window) -> BackendResult<bool> + 'static,
{
    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.state.handle_event(&event);
                }
                Event::AboutToWait => match frame(&mut window) {
                    Ok(true) => window.request_redraw(),
                    Ok(false) => elwt.exit(),
                    Err(e) => {
                        log::error!("Frame failed: {}", e);
                        elwt.exit();
                    }
                },
                _ => {}
            }
        })
        .map_err(|e| BackendError::InitializationFailed(format!("event loop: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_is_reported_once() {
        let mut state = WindowState::new(800, 600);
        assert_eq!(state.take_resize(), None);

        state.handle_event(&WindowEvent::Resized(PhysicalSize::new(1024, 768)));
        state.handle_event(&WindowEvent::Resized(PhysicalSize::new(640, 480)));
        assert_eq!(state.take_resize(), Some((640, 480)));
        assert_eq!(state.take_resize(), None);
    }

    #[test]
    fn test_close_request() {
        let mut state = WindowState::new(800, 600);
        assert!(!state.should_close());
        state.handle_event(&WindowEvent::CloseRequested);
        assert!(state.should_close());
    }

    #[test]
    fn test_minimize_reports_zero_size() {
        let mut state = WindowState::new(800, 600);
        state.handle_event(&WindowEvent::Resized(PhysicalSize::new(0, 0)));
        assert_eq!(state.take_resize(), Some((0, 0)));
    }
}
