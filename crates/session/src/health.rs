//! Connection quality monitoring and recovery triggers
//!
//! The monitor samples transport statistics on a fixed interval, classifies
//! them onto an ordered quality scale, publishes a report per sample, and
//! converts sustained degradation into an active renegotiation instead of a
//! user-visible stall. Hard transport failures are handled separately by the
//! negotiation supervisor; this loop exists for the silent kind.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::events::{EventSender, SessionEvent};

/// One sample of transport statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualitySample {
    /// Fraction of packets lost (0.0 - 1.0)
    pub packet_loss_rate: f64,
    /// Interarrival jitter in milliseconds
    pub jitter_ms: f64,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Frames decoded since the previous sample
    pub frames_decoded: u64,
    /// Frames dropped since the previous sample
    pub frames_dropped: u64,
}

impl QualitySample {
    /// Quality score (0-100, higher is better)
    ///
    /// Deductions for RTT above 100ms, packet loss (10 points per percent),
    /// jitter above 30ms, and dropped frames.
    pub fn score(&self) -> u32 {
        let mut score = 100u32;

        if self.rtt_ms > 100.0 {
            let deduction = ((self.rtt_ms - 100.0) / 10.0).min(30.0) as u32;
            score = score.saturating_sub(deduction);
        }

        let loss_deduction = (self.packet_loss_rate * 100.0 * 10.0).min(40.0) as u32;
        score = score.saturating_sub(loss_deduction);

        if self.jitter_ms > 30.0 {
            let deduction = ((self.jitter_ms - 30.0) / 5.0).min(20.0) as u32;
            score = score.saturating_sub(deduction);
        }

        let total_frames = self.frames_decoded + self.frames_dropped;
        if total_frames > 0 {
            let drop_rate = self.frames_dropped as f64 / total_frames as f64;
            let deduction = (drop_rate * 100.0).min(20.0) as u32;
            score = score.saturating_sub(deduction);
        }

        score
    }

    /// Whether the media source should back its bitrate off
    pub fn should_reduce_bitrate(&self) -> bool {
        self.packet_loss_rate > 0.05 || self.rtt_ms > 300.0
    }

    /// Whether the media source has headroom to raise its bitrate
    pub fn can_increase_bitrate(&self) -> bool {
        self.packet_loss_rate < 0.01 && self.rtt_ms < 100.0
    }
}

/// Ordered connection quality scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionQuality {
    /// Transport reports no connectivity
    Disconnected,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl ConnectionQuality {
    /// Classify a score
    pub fn from_score(score: u32) -> Self {
        match score {
            90..=u32::MAX => ConnectionQuality::Excellent,
            70..=89 => ConnectionQuality::Good,
            50..=69 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

/// Quality report published once per sample
#[derive(Debug, Clone, PartialEq)]
pub struct QualityReport {
    /// Classified quality
    pub quality: ConnectionQuality,
    /// Underlying score (0 when disconnected)
    pub score: u32,
    /// The raw sample, absent when disconnected
    pub sample: Option<QualitySample>,
    /// Bitrate reduction hint for the media source
    pub should_reduce_bitrate: bool,
    /// Bitrate increase hint for the media source
    pub can_increase_bitrate: bool,
}

impl QualityReport {
    fn from_sample(sample: QualitySample) -> Self {
        let score = sample.score();
        Self {
            quality: ConnectionQuality::from_score(score),
            score,
            should_reduce_bitrate: sample.should_reduce_bitrate(),
            can_increase_bitrate: sample.can_increase_bitrate(),
            sample: Some(sample),
        }
    }

    fn disconnected() -> Self {
        Self {
            quality: ConnectionQuality::Disconnected,
            score: 0,
            sample: None,
            should_reduce_bitrate: true,
            can_increase_bitrate: false,
        }
    }
}

/// Source of transport statistics
///
/// The production implementation is a [`MetricsHandle`] fed by whoever sees
/// RTCP reports and decoder counters; tests script their own samples.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Current statistics, or `None` when the transport reports no
    /// connectivity
    async fn sample(&self) -> Option<QualitySample>;
}

/// Shared, updatable statistics for one peer connection
pub struct MetricsHandle {
    sample: RwLock<QualitySample>,
    connected: AtomicBool,
}

impl MetricsHandle {
    /// Create a handle reporting a disconnected transport
    pub fn new() -> Self {
        Self {
            sample: RwLock::new(QualitySample::default()),
            connected: AtomicBool::new(false),
        }
    }

    /// Replace the current sample
    pub async fn update(&self, sample: QualitySample) {
        *self.sample.write().await = sample;
    }

    /// Record transport connectivity
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Current sample
    pub async fn snapshot(&self) -> QualitySample {
        self.sample.read().await.clone()
    }
}

impl Default for MetricsHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatsSource for MetricsHandle {
    async fn sample(&self) -> Option<QualitySample> {
        if self.connected.load(Ordering::SeqCst) {
            Some(self.snapshot().await)
        } else {
            None
        }
    }
}

/// Command the monitor issues to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Quality dropped to `poor` while nominally connected
    QualityDegraded,
    /// Quality came back up after a degraded stretch
    QualityRecovered,
    /// Force a full renegotiation of the peer transport
    RenegotiateTransport,
}

/// Per-peer health monitor loop
pub struct HealthMonitor {
    peer_id: String,
    config: HealthConfig,
    source: Arc<dyn StatsSource>,
    events: EventSender,
    actions: mpsc::UnboundedSender<RecoveryAction>,
}

impl HealthMonitor {
    /// Create a monitor for one peer connection
    pub fn new(
        peer_id: impl Into<String>,
        config: HealthConfig,
        source: Arc<dyn StatsSource>,
        events: EventSender,
        actions: mpsc::UnboundedSender<RecoveryAction>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            config,
            source,
            events,
            actions,
        }
    }

    /// Run the sampling loop until the event channel closes
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_poor = 0u32;

        info!(peer_id = %self.peer_id, "Health monitor started");

        loop {
            ticker.tick().await;

            let report = match self.source.sample().await {
                Some(sample) => QualityReport::from_sample(sample),
                None => QualityReport::disconnected(),
            };

            debug!(
                peer_id = %self.peer_id,
                quality = ?report.quality,
                score = report.score,
                "Quality sample"
            );

            // A `poor` streak converts silent degradation into repair; the
            // hard-failure path is the supervisor's, so `disconnected`
            // samples only reset the streak here.
            match report.quality {
                ConnectionQuality::Poor => {
                    consecutive_poor += 1;
                    if consecutive_poor == 1 {
                        let _ = self.actions.send(RecoveryAction::QualityDegraded);
                    }
                    if consecutive_poor >= self.config.poor_samples_before_recovery {
                        warn!(
                            peer_id = %self.peer_id,
                            samples = consecutive_poor,
                            "Sustained poor quality, forcing renegotiation"
                        );
                        let _ = self.actions.send(RecoveryAction::RenegotiateTransport);
                        consecutive_poor = 0;
                    }
                }
                quality => {
                    if consecutive_poor > 0 && quality >= ConnectionQuality::Fair {
                        let _ = self.actions.send(RecoveryAction::QualityRecovered);
                    }
                    consecutive_poor = 0;
                }
            }

            if self
                .events
                .send(SessionEvent::Monitors {
                    peer_id: self.peer_id.clone(),
                    report,
                })
                .is_err()
            {
                break;
            }
        }

        debug!(peer_id = %self.peer_id, "Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct ScriptedStats {
        samples: Mutex<VecDeque<Option<QualitySample>>>,
    }

    impl ScriptedStats {
        fn new(samples: Vec<Option<QualitySample>>) -> Arc<Self> {
            Arc::new(Self {
                samples: Mutex::new(samples.into()),
            })
        }
    }

    #[async_trait]
    impl StatsSource for ScriptedStats {
        async fn sample(&self) -> Option<QualitySample> {
            let mut samples = self.samples.lock().await;
            samples.pop_front().unwrap_or(None)
        }
    }

    fn poor_sample() -> QualitySample {
        QualitySample {
            packet_loss_rate: 0.10,
            jitter_ms: 120.0,
            rtt_ms: 500.0,
            ..Default::default()
        }
    }

    fn good_sample() -> QualitySample {
        QualitySample {
            packet_loss_rate: 0.001,
            jitter_ms: 8.0,
            rtt_ms: 40.0,
            frames_decoded: 60,
            frames_dropped: 0,
        }
    }

    #[test]
    fn test_score_perfect() {
        assert_eq!(good_sample().score(), 100);
    }

    #[test]
    fn test_score_poor() {
        assert!(poor_sample().score() < 50);
    }

    #[test]
    fn test_classification_thresholds() {
        assert_eq!(
            ConnectionQuality::from_score(95),
            ConnectionQuality::Excellent
        );
        assert_eq!(ConnectionQuality::from_score(90), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_score(75), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_score(55), ConnectionQuality::Fair);
        assert_eq!(ConnectionQuality::from_score(20), ConnectionQuality::Poor);
    }

    #[test]
    fn test_quality_scale_is_ordered() {
        assert!(ConnectionQuality::Excellent > ConnectionQuality::Good);
        assert!(ConnectionQuality::Good > ConnectionQuality::Fair);
        assert!(ConnectionQuality::Fair > ConnectionQuality::Poor);
        assert!(ConnectionQuality::Poor > ConnectionQuality::Disconnected);
    }

    #[test]
    fn test_bitrate_hints() {
        assert!(poor_sample().should_reduce_bitrate());
        assert!(!poor_sample().can_increase_bitrate());
        assert!(!good_sample().should_reduce_bitrate());
        assert!(good_sample().can_increase_bitrate());
    }

    #[test]
    fn test_frame_drops_hurt_score() {
        let dropping = QualitySample {
            frames_decoded: 30,
            frames_dropped: 30,
            ..good_sample()
        };
        assert!(dropping.score() < good_sample().score());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_poor_triggers_renegotiation() {
        let source = ScriptedStats::new(vec![
            Some(good_sample()),
            Some(poor_sample()),
            Some(poor_sample()),
            Some(poor_sample()),
        ]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (actions_tx, mut actions_rx) = mpsc::unbounded_channel();

        let config = HealthConfig {
            sample_interval: Duration::from_millis(10),
            poor_samples_before_recovery: 3,
        };
        let monitor = HealthMonitor::new("peer-1", config, source, events_tx, actions_tx);
        let task = tokio::spawn(monitor.run());

        // four samples: one good, three poor
        for _ in 0..4 {
            let event = events_rx.recv().await.unwrap();
            assert!(matches!(event, SessionEvent::Monitors { .. }));
        }

        // the streak first marks degradation, then forces repair
        assert_eq!(
            actions_rx.recv().await,
            Some(RecoveryAction::QualityDegraded)
        );
        assert_eq!(
            actions_rx.recv().await,
            Some(RecoveryAction::RenegotiateTransport)
        );

        drop(events_rx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_quality_resets_streak() {
        let source = ScriptedStats::new(vec![
            Some(poor_sample()),
            Some(poor_sample()),
            Some(good_sample()),
            Some(poor_sample()),
            Some(poor_sample()),
        ]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (actions_tx, mut actions_rx) = mpsc::unbounded_channel();

        let config = HealthConfig {
            sample_interval: Duration::from_millis(10),
            poor_samples_before_recovery: 3,
        };
        let monitor = HealthMonitor::new("peer-1", config, source, events_tx, actions_tx);
        let task = tokio::spawn(monitor.run());

        for _ in 0..5 {
            events_rx.recv().await.unwrap();
        }

        // degraded/recovered markers, but never a renegotiation
        let mut actions = Vec::new();
        while let Ok(action) = actions_rx.try_recv() {
            actions.push(action);
        }
        assert!(!actions.contains(&RecoveryAction::RenegotiateTransport));
        assert_eq!(
            actions,
            vec![
                RecoveryAction::QualityDegraded,
                RecoveryAction::QualityRecovered,
                RecoveryAction::QualityDegraded,
            ]
        );

        drop(events_rx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_source_reports_disconnected() {
        let source = ScriptedStats::new(vec![None]);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (actions_tx, _actions_rx) = mpsc::unbounded_channel();

        let monitor = HealthMonitor::new(
            "peer-1",
            HealthConfig {
                sample_interval: Duration::from_millis(10),
                poor_samples_before_recovery: 3,
            },
            source,
            events_tx,
            actions_tx,
        );
        let task = tokio::spawn(monitor.run());

        match events_rx.recv().await.unwrap() {
            SessionEvent::Monitors { report, .. } => {
                assert_eq!(report.quality, ConnectionQuality::Disconnected);
                assert_eq!(report.score, 0);
                assert!(report.sample.is_none());
            }
            other => panic!("expected monitors event, got {:?}", other),
        }

        drop(events_rx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_handle_source() {
        let handle = Arc::new(MetricsHandle::new());
        assert_eq!(handle.sample().await, None);

        handle.set_connected(true);
        handle.update(good_sample()).await;
        assert_eq!(handle.sample().await, Some(good_sample()));

        handle.set_connected(false);
        assert_eq!(handle.sample().await, None);
    }
}
