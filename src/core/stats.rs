//! Frame statistics
//!
//! Rolling window of frame times plus the per-frame triangle counter the
//! renderer feeds while drawing.

use std::collections::VecDeque;

const DEFAULT_WINDOW: usize = 120;

/// Rolling frame timing and scene statistics.
pub struct FrameStats {
    frame_times: VecDeque<f32>,
    window: usize,
    triangles: usize,
    frames: u64,
}

impl FrameStats {
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            frame_times: VecDeque::with_capacity(window),
            window: window.max(1),
            triangles: 0,
            frames: 0,
        }
    }

    /// Record a completed frame's duration in seconds.
    pub fn push_frame(&mut self, dt: f32) {
        if self.frame_times.len() == self.window {
            self.frame_times.pop_front();
        }
        self.frame_times.push_back(dt);
        self.frames += 1;
    }

    /// Reset the per-frame counters at the start of a frame.
    pub fn start_frame(&mut self) {
        self.triangles = 0;
    }

    /// Count triangles submitted this frame.
    pub fn add_triangles(&mut self, count: usize) {
        self.triangles += count;
    }

    /// Triangles submitted so far this frame.
    #[must_use]
    pub fn triangles(&self) -> usize {
        self.triangles
    }

    /// Total frames recorded since creation.
    #[must_use]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Average frames per second over the window.
    #[must_use]
    pub fn fps(&self) -> f32 {
        let avg = self.average_ms() / 1000.0;
        if avg > 0.0 { 1.0 / avg } else { 0.0 }
    }

    /// Average frame time over the window, in milliseconds.
    #[must_use]
    pub fn average_ms(&self) -> f32 {
        if self.frame_times.is_empty() {
            return 0.0;
        }
        self.frame_times.iter().sum::<f32>() / self.frame_times.len() as f32 * 1000.0
    }

    /// Fastest frame in the window, in milliseconds.
    #[must_use]
    pub fn min_ms(&self) -> f32 {
        if self.frame_times.is_empty() {
            return 0.0;
        }
        self.frame_times.iter().copied().fold(f32::INFINITY, f32::min) * 1000.0
    }

    /// Slowest frame in the window, in milliseconds.
    #[must_use]
    pub fn max_ms(&self) -> f32 {
        self.frame_times.iter().copied().fold(0.0, f32::max) * 1000.0
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_window() {
        let mut stats = FrameStats::with_window(2);
        stats.push_frame(0.010);
        stats.push_frame(0.020);
        stats.push_frame(0.030);

        // The first sample fell out of the window.
        assert!((stats.average_ms() - 25.0).abs() < 1e-3);
        assert!((stats.min_ms() - 20.0).abs() < 1e-3);
        assert!((stats.max_ms() - 30.0).abs() < 1e-3);
        assert_eq!(stats.frames(), 3);
    }

    #[test]
    fn test_fps() {
        let mut stats = FrameStats::new();
        for _ in 0..10 {
            stats.push_frame(0.020);
        }
        assert!((stats.fps() - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_triangle_counter_resets() {
        let mut stats = FrameStats::new();
        stats.start_frame();
        stats.add_triangles(100);
        stats.add_triangles(50);
        assert_eq!(stats.triangles(), 150);

        stats.start_frame();
        assert_eq!(stats.triangles(), 0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = FrameStats::new();
        assert_eq!(stats.fps(), 0.0);
        assert_eq!(stats.average_ms(), 0.0);
        assert_eq!(stats.min_ms(), 0.0);
    }
}
