use std::{collections::VecDeque, fmt, time::Duration};

use na::DVector;
use tracing::info;

use crate::{driver::LoopMode, robot::NUM_LEGS, spatial::wrench::Wrench, types::Float};

/// Element-wise running maximum of absolute values
#[derive(Debug, Clone, PartialEq)]
pub struct RunningMax {
    max: DVector<Float>,
}

impl RunningMax {
    pub fn new(n: usize) -> Self {
        RunningMax {
            max: DVector::zeros(n),
        }
    }

    /// Non-finite entries and length mismatches are ignored
    pub fn update(&mut self, values: &DVector<Float>) {
        if values.len() != self.max.len() {
            return;
        }
        for (current, v) in self.max.iter_mut().zip(values.iter()) {
            if v.is_finite() {
                *current = current.max(v.abs());
            }
        }
    }

    pub fn current_max(&self) -> &DVector<Float> {
        &self.max
    }

    pub fn reset(&mut self) {
        self.max.fill(0.);
    }
}

/// Snapshot of one control tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickRecord {
    pub tick: u64,
    pub time: Float,
    pub mode: LoopMode,
    /// Wrench handed to the allocator
    pub reference_wrench: Wrench,
    /// Foot forces stacked in leg order, zero for swing legs
    pub forces: DVector<Float>,
    /// Torques actually emitted
    pub torques: DVector<Float>,
    pub contacts: [bool; NUM_LEGS],
    pub solve_time: Option<Duration>,
    pub fault: Option<String>,
}

/// Bounded history of tick records plus running extremes over the whole run
#[derive(Debug, Clone)]
pub struct Telemetry {
    capacity: usize,
    records: VecDeque<TickRecord>,
    max_torques: RunningMax,
    max_forces: RunningMax,
    ticks: u64,
    faults: u64,
    worst_solve_time: Duration,
}

impl Telemetry {
    pub fn new(capacity: usize, num_joints: usize) -> Self {
        Telemetry {
            capacity,
            records: VecDeque::with_capacity(capacity),
            max_torques: RunningMax::new(num_joints),
            max_forces: RunningMax::new(3 * NUM_LEGS),
            ticks: 0,
            faults: 0,
            worst_solve_time: Duration::ZERO,
        }
    }

    pub fn record(&mut self, record: TickRecord) {
        self.ticks += 1;
        if record.fault.is_some() {
            self.faults += 1;
        }
        if let Some(t) = record.solve_time {
            self.worst_solve_time = self.worst_solve_time.max(t);
        }
        self.max_torques.update(&record.torques);
        self.max_forces.update(&record.forces);

        if self.capacity == 0 {
            return;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// Oldest first
    pub fn records(&self) -> impl Iterator<Item = &TickRecord> {
        self.records.iter()
    }

    pub fn latest(&self) -> Option<&TickRecord> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_torques(&self) -> &DVector<Float> {
        self.max_torques.current_max()
    }

    pub fn max_forces(&self) -> &DVector<Float> {
        self.max_forces.current_max()
    }

    pub fn clear(&mut self) {
        *self = Telemetry::new(self.capacity, self.max_torques.current_max().len());
    }

    pub fn summary(&self) -> TelemetrySummary {
        TelemetrySummary {
            ticks: self.ticks,
            faults: self.faults,
            peak_torque: self.max_torques().max(),
            peak_force: self.max_forces().max(),
            worst_solve_time: self.worst_solve_time,
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        info!(
            ticks = summary.ticks,
            faults = summary.faults,
            peak_torque = summary.peak_torque,
            peak_force = summary.peak_force,
            worst_solve_us = summary.worst_solve_time.as_micros() as u64,
            "telemetry summary"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySummary {
    pub ticks: u64,
    pub faults: u64,
    pub peak_torque: Float,
    pub peak_force: Float,
    pub worst_solve_time: Duration,
}

impl fmt::Display for TelemetrySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ticks, {} faults, peak torque {:.2} Nm, peak force {:.2} N, worst solve {:?}",
            self.ticks, self.faults, self.peak_torque, self.peak_force, self.worst_solve_time
        )
    }
}
