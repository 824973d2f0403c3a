//! Bounded plot buffer and refresh timer
//!
//! [`PlotBuffer`] keeps the most recent readings and publishes an immutable
//! [`PlotSnapshot`] through a `watch` channel after every addition. A display
//! task started with [`spawn_refresh`] wakes on its own timer, takes the latest
//! snapshot and renders it. Neither side ever waits on the other.

use super::Plotter;
use crate::measurement::{Channel, Reading};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Related channels drawn on one chart
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlotGroup {
    /// Dry and wet flows with their setpoints
    Flows,
    /// Cell, ambient and dewpoint temperatures
    Temperatures,
    /// Relative humidity
    Humidity,
}

impl PlotGroup {
    /// Every chart, in display order
    pub const ALL: [PlotGroup; 3] = [PlotGroup::Flows, PlotGroup::Temperatures, PlotGroup::Humidity];

    /// Channels drawn on this chart
    pub fn channels(self) -> &'static [Channel] {
        match self {
            PlotGroup::Flows => &[
                Channel::DryFlow,
                Channel::DrySetpoint,
                Channel::WetFlow,
                Channel::WetSetpoint,
            ],
            PlotGroup::Temperatures => &[
                Channel::CellTemp,
                Channel::AmbientTemp,
                Channel::DewpointTemp,
            ],
            PlotGroup::Humidity => &[Channel::RelativeHumidity],
        }
    }

    /// Chart title with unit
    pub fn title(self) -> &'static str {
        match self {
            PlotGroup::Flows => "Flow Rates (ml/min)",
            PlotGroup::Temperatures => "Temperatures (°C)",
            PlotGroup::Humidity => "Relative Humidity (%)",
        }
    }
}

/// Immutable view of the buffer at one point in time
#[derive(Clone, Debug, Default)]
pub struct PlotSnapshot {
    readings: Arc<[Reading]>,
}

impl PlotSnapshot {
    /// Number of readings in the snapshot
    pub fn len(&self) -> usize {
        self.readings.len()
    }

    /// True before the first reading arrives
    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Most recent reading
    pub fn latest(&self) -> Option<&Reading> {
        self.readings.last()
    }

    /// `[seconds since first reading, value]` pairs for `channel`, skipping
    /// readings where it was absent.
    pub fn series(&self, channel: Channel) -> Vec<[f64; 2]> {
        let Some(origin) = self.readings.first().map(|r| r.timestamp) else {
            return Vec::new();
        };
        self.readings
            .iter()
            .filter_map(|r| {
                let value = r.get(channel)?;
                let elapsed = (r.timestamp - origin).num_milliseconds() as f64 / 1000.0;
                Some([elapsed, value])
            })
            .collect()
    }

    /// Every series of a chart group, labelled
    pub fn group(&self, group: PlotGroup) -> Vec<(&'static str, Vec<[f64; 2]>)> {
        group
            .channels()
            .iter()
            .map(|c| (c.label(), self.series(*c)))
            .collect()
    }
}

/// Fixed-capacity window of recent readings
pub struct PlotBuffer {
    max_points: usize,
    points: VecDeque<Reading>,
    tx: watch::Sender<PlotSnapshot>,
}

impl PlotBuffer {
    /// Keep at most `max_points` readings (at least one)
    pub fn new(max_points: usize) -> Self {
        let max_points = max_points.max(1);
        let (tx, _rx) = watch::channel(PlotSnapshot::default());
        Self {
            max_points,
            points: VecDeque::with_capacity(max_points),
            tx,
        }
    }

    /// Receiver that always holds the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<PlotSnapshot> {
        self.tx.subscribe()
    }

    /// Number of readings held
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no reading has been added yet
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn publish(&self) {
        let readings: Arc<[Reading]> = self.points.iter().cloned().collect();
        self.tx.send_replace(PlotSnapshot { readings });
    }
}

impl Plotter for PlotBuffer {
    fn add_data_point(&mut self, reading: &Reading) {
        if self.points.len() == self.max_points {
            self.points.pop_front();
        }
        self.points.push_back(reading.clone());
        self.publish();
    }
}

/// Run `render` on the latest snapshot every `period` until the publishing
/// buffer is dropped. Ticks that find an empty buffer are skipped.
pub fn spawn_refresh<F>(
    mut rx: watch::Receiver<PlotSnapshot>,
    period: Duration,
    mut render: F,
) -> JoinHandle<()>
where
    F: FnMut(&PlotSnapshot) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if rx.has_changed().is_err() {
                break;
            }
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.is_empty() {
                continue;
            }
            render(&snapshot);
        }
    })
}
