//! Landmark provider seam.
//!
//! The landmark model is an external collaborator. The pipeline only needs
//! "zero or one face per image" and must treat a provider that is not ready
//! as a missing sample, never as a fatal error.

use crate::types::LandmarkSet;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("landmark provider not ready")]
    Unavailable,
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces facial landmarks for a grayscale image.
pub trait LandmarkProvider {
    /// Landmarks for the most prominent face, `Ok(None)` if there is none.
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<LandmarkSet>, DetectionError>;
}

impl<P: LandmarkProvider + ?Sized> LandmarkProvider for Box<P> {
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<LandmarkSet>, DetectionError> {
        (**self).detect(image, width, height)
    }
}

/// A provider that loads on a background thread.
///
/// Reports [`DetectionError::Unavailable`] until the loader finishes. A loader
/// failure is logged once and leaves the provider permanently unavailable.
pub struct DeferredProvider<P> {
    pending: Option<Receiver<Result<P, DetectionError>>>,
    inner: Option<P>,
}

impl<P: LandmarkProvider + Send + 'static> DeferredProvider<P> {
    /// Run `load` on a dedicated thread.
    pub fn spawn<F>(load: F) -> std::io::Result<Self>
    where
        F: FnOnce() -> Result<P, DetectionError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("blinkmon-provider-load".into())
            .spawn(move || {
                let _ = tx.send(load());
            })?;
        Ok(Self {
            pending: Some(rx),
            inner: None,
        })
    }
}

impl<P> DeferredProvider<P> {
    /// Wrap a provider that is already loaded.
    pub fn ready(provider: P) -> Self {
        Self {
            pending: None,
            inner: Some(provider),
        }
    }

    pub fn is_ready(&mut self) -> bool {
        self.poll();
        self.inner.is_some()
    }

    fn poll(&mut self) {
        let Some(rx) = &self.pending else {
            return;
        };
        match rx.try_recv() {
            Ok(Ok(provider)) => {
                tracing::info!("landmark provider ready");
                self.inner = Some(provider);
                self.pending = None;
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "landmark provider failed to load; samples stay empty");
                self.pending = None;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                tracing::error!("landmark provider loader exited without a result");
                self.pending = None;
            }
        }
    }
}

impl<P: LandmarkProvider> LandmarkProvider for DeferredProvider<P> {
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<LandmarkSet>, DetectionError> {
        self.poll();
        match self.inner.as_mut() {
            Some(provider) => provider.detect(image, width, height),
            None => Err(DetectionError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Point;
    use std::sync::mpsc::sync_channel;
    use std::time::Duration;

    struct FixedProvider;

    impl LandmarkProvider for FixedProvider {
        fn detect(
            &mut self,
            _: &[u8],
            _: u32,
            _: u32,
        ) -> Result<Option<LandmarkSet>, DetectionError> {
            Ok(Some(LandmarkSet::new(vec![Point::new(0.5, 0.5)])))
        }
    }

    fn wait_ready<P>(provider: &mut DeferredProvider<P>) -> bool {
        for _ in 0..200 {
            provider.poll();
            if provider.inner.is_some() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_unavailable_until_loaded() {
        let (gate_tx, gate_rx) = sync_channel::<()>(0);
        let mut provider = DeferredProvider::spawn(move || {
            gate_rx.recv().ok();
            Ok(FixedProvider)
        })
        .unwrap();

        let result = provider.detect(&[], 0, 0);
        assert!(matches!(result, Err(DetectionError::Unavailable)));

        gate_tx.send(()).unwrap();
        assert!(wait_ready(&mut provider));
        assert!(provider.detect(&[], 0, 0).unwrap().is_some());
    }

    #[test]
    fn test_failed_load_stays_unavailable() {
        let load = || Err(DetectionError::ModelNotFound("x.onnx".into()));
        let mut provider = DeferredProvider::<FixedProvider>::spawn(load).unwrap();
        for _ in 0..50 {
            provider.poll();
            if provider.pending.is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(provider.pending.is_none());
        assert!(!provider.is_ready());
        let result = provider.detect(&[], 0, 0);
        assert!(matches!(result, Err(DetectionError::Unavailable)));
    }

    #[test]
    fn test_ready_provider() {
        let mut provider = DeferredProvider::ready(FixedProvider);
        assert!(provider.is_ready());
    }
}
