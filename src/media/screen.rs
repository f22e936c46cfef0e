//! Bildschirmfreigabe (Substream)
//!
//! Eine einzige Pump-Task liest die aktuelle Capture-Quelle und nimmt
//! Steuerbefehle entgegen. Ein Zielwechsel ersetzt die Quelle innerhalb der
//! Task, daher vermischen sich nie Bilder von altem und neuem Ziel.

use super::render::VideoFrame;
use crate::devices::{CaptureStream, ScreenCaptureTarget};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenCaptureState {
    Idle,
    Capturing,
    Paused,
}

#[derive(Debug)]
pub enum ScreenCommand {
    /// Neue Quelle; die alte wird sofort geschlossen
    Switch(CaptureStream<VideoFrame>),
    Pause,
    Resume,
    Stop,
}

async fn next_frame(source: &mut Option<CaptureStream<VideoFrame>>) -> Option<VideoFrame> {
    match source {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Startet die Pump-Task. `sink` bekommt jedes Bild außerhalb der Pause.
pub fn spawn_pump<F>(runtime: &Handle, mut sink: F) -> (mpsc::UnboundedSender<ScreenCommand>, JoinHandle<()>)
where
    F: FnMut(VideoFrame) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = runtime.spawn(async move {
        let mut source: Option<CaptureStream<VideoFrame>> = None;
        let mut paused = false;
        loop {
            tokio::select! {
                biased;
                command = rx.recv() => match command {
                    Some(ScreenCommand::Switch(stream)) => source = Some(stream),
                    Some(ScreenCommand::Pause) => paused = true,
                    Some(ScreenCommand::Resume) => paused = false,
                    Some(ScreenCommand::Stop) | None => break,
                },
                frame = next_frame(&mut source) => match frame {
                    Some(frame) if !paused => sink(frame),
                    Some(_) => {}
                    None => {
                        tracing::warn!("Screen capture source ended");
                        source = None;
                    }
                },
            }
        }
        tracing::debug!("Screen pump stopped");
    });
    (tx, task)
}

/// Zustand der Freigabe, gehalten vom Track Manager
#[derive(Debug)]
pub struct ScreenShareController {
    state: ScreenCaptureState,
    target: Option<ScreenCaptureTarget>,
    generation: u64,
    commands: Option<mpsc::UnboundedSender<ScreenCommand>>,
    task: Option<JoinHandle<()>>,
}

impl ScreenShareController {
    pub fn new() -> Self {
        Self {
            state: ScreenCaptureState::Idle,
            target: None,
            generation: 0,
            commands: None,
            task: None,
        }
    }

    pub fn state(&self) -> ScreenCaptureState {
        self.state
    }

    pub fn target(&self) -> Option<&ScreenCaptureTarget> {
        self.target.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state != ScreenCaptureState::Idle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Setzt das Ziel. Liefert eine neue Generation, wenn die laufende
    /// Aufnahme auf das Ziel umgeschaltet werden muss.
    pub fn select_target(&mut self, target: ScreenCaptureTarget) -> Option<u64> {
        self.target = Some(target);
        if self.is_active() {
            self.generation += 1;
            Some(self.generation)
        } else {
            None
        }
    }

    /// Wechselt nach Capturing und startet die Pump. Liefert die Generation
    /// für das asynchrone Öffnen der Quelle.
    pub fn start<F>(&mut self, runtime: &Handle, sink: F) -> u64
    where
        F: FnMut(VideoFrame) + Send + 'static,
    {
        self.generation += 1;
        if self.commands.is_none() {
            let (commands, task) = spawn_pump(runtime, sink);
            self.commands = Some(commands);
            self.task = Some(task);
        }
        self.state = ScreenCaptureState::Capturing;
        self.generation
    }

    /// Übergibt eine geöffnete Quelle, falls sie noch aktuell ist
    pub fn attach(&mut self, generation: u64, stream: CaptureStream<VideoFrame>) -> bool {
        if generation != self.generation || !self.is_active() {
            return false;
        }
        self.send(ScreenCommand::Switch(stream))
    }

    pub fn pause(&mut self) -> bool {
        if self.state != ScreenCaptureState::Capturing {
            return false;
        }
        self.state = ScreenCaptureState::Paused;
        self.send(ScreenCommand::Pause)
    }

    pub fn resume(&mut self) -> bool {
        if self.state != ScreenCaptureState::Paused {
            return false;
        }
        self.state = ScreenCaptureState::Capturing;
        self.send(ScreenCommand::Resume)
    }

    /// Beendet die Aufnahme; `false` wenn nichts lief
    pub fn stop(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.generation += 1;
        self.state = ScreenCaptureState::Idle;
        self.send(ScreenCommand::Stop);
        self.commands = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        true
    }

    fn send(&self, command: ScreenCommand) -> bool {
        self.commands
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }
}

impl Default for ScreenShareController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::capture_channel;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(width: u32) -> VideoFrame {
        VideoFrame::test_pattern(width, 2, 0, 0)
    }

    #[tokio::test]
    async fn test_switch_never_interleaves_targets() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let mut controller = ScreenShareController::new();
        let generation = controller.start(&Handle::current(), move |f: VideoFrame| {
            sink_seen.lock().push(f.width)
        });

        let (old_sink, old_stream) = capture_channel(16);
        assert!(controller.attach(generation, old_stream));
        old_sink.push(frame(4));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let next = controller.select_target(crate::devices::ScreenCaptureTarget::whole(
            crate::devices::ScreenSource {
                id: "window-1".into(),
                name: "Window".into(),
                kind: crate::devices::ScreenSourceKind::Window,
                width: 8,
                height: 2,
            },
        ));
        let (new_sink, new_stream) = capture_channel(16);
        assert!(controller.attach(next.unwrap(), new_stream));
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Alte Quelle ist geschlossen, ihre Bilder kommen nicht mehr an
        assert!(!old_sink.push(frame(4)));
        new_sink.push(frame(8));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock(), vec![4, 8]);
    }

    #[tokio::test]
    async fn test_paused_frames_are_dropped() {
        let seen = Arc::new(Mutex::new(0usize));
        let sink_seen = seen.clone();
        let mut controller = ScreenShareController::new();
        let generation = controller.start(&Handle::current(), move |_f: VideoFrame| {
            *sink_seen.lock() += 1
        });
        let (sink, stream) = capture_channel(16);
        controller.attach(generation, stream);

        assert!(controller.pause());
        assert!(!controller.pause());
        tokio::time::sleep(Duration::from_millis(10)).await;
        sink.push(frame(4));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), 0);

        assert!(controller.resume());
        tokio::time::sleep(Duration::from_millis(10)).await;
        sink.push(frame(4));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), 1);

        assert!(controller.stop());
        assert_eq!(controller.state(), ScreenCaptureState::Idle);
    }

    #[test]
    fn test_stale_source_is_rejected() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let mut controller = ScreenShareController::new();
        let generation = controller.start(runtime.handle(), |_f: VideoFrame| {});
        controller.stop();
        let (_sink, stream) = capture_channel(1);
        assert!(!controller.attach(generation, stream));
    }
}
