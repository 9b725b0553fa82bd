//! Fixed-rate control loop.
//!
//! One tick reads the simulator, runs PID → allocation → torque mapping and
//! writes a torque command back. Ticks are strictly sequential. Recoverable
//! failures put the loop in `Faulted` and emit a fallback command for that
//! tick; contract violations are returned to the caller.

use std::fmt;

use na::{DVector, Vector6};
use tracing::{debug, info, warn};

use crate::{
    config::{ControllerConfig, FallbackPolicy},
    control::{
        allocator::{stance_feet, Allocation, ForceAllocator, ForceWeight},
        pid::{BodyPid, PidState},
        qp::{ClarabelSolver, QpSolver},
        torque_mapper::TorqueMapper,
    },
    error::{ConfigError, ControlError},
    kinematics::{Kinematics, QuadrupedKinematics},
    robot::{ContactSet, DesiredTrajectory, JointTorqueCommand, LegId, RobotState, NUM_LEGS},
    spatial::{pose::Pose, wrench::Wrench},
    telemetry::{Telemetry, TelemetrySummary, TickRecord},
    types::Float,
    GRAVITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Idle,
    Running,
    /// The last tick fell back to a safe command. Cleared by `reset`.
    Faulted,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopMode::Idle => "Idle",
            LoopMode::Running => "Running",
            LoopMode::Faulted => "Faulted",
        };
        write!(f, "{}", name)
    }
}

/// What the simulator reports at the start of a tick
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub state: RobotState,
    pub contacts: ContactSet,
}

/// The physics the controller runs against
pub trait Simulator {
    fn observe(&mut self) -> Observation;

    /// Apply `command` as actuator input and advance the simulation by `dt`
    fn actuate(&mut self, command: &JointTorqueCommand, dt: Float);
}

pub trait TrajectorySource {
    fn desired(&mut self, time: Float, state: &RobotState) -> DesiredTrajectory;
}

impl<F> TrajectorySource for F
where
    F: FnMut(Float, &RobotState) -> DesiredTrajectory,
{
    fn desired(&mut self, time: Float, state: &RobotState) -> DesiredTrajectory {
        self(time, state)
    }
}

/// Always the same reference
#[derive(Debug, Clone, PartialEq)]
pub struct FixedSetpoint {
    reference: DesiredTrajectory,
}

impl FixedSetpoint {
    pub fn new(reference: DesiredTrajectory) -> Self {
        FixedSetpoint { reference }
    }

    pub fn hold(pose: Pose) -> Self {
        FixedSetpoint::new(DesiredTrajectory::hold(pose))
    }
}

impl TrajectorySource for FixedSetpoint {
    fn desired(&mut self, _time: Float, _state: &RobotState) -> DesiredTrajectory {
        self.reference.clone()
    }
}

/// Torques for legs in swing. Only the joints of swing legs are taken from
/// it; stance joints always come from the balance pipeline.
pub trait SwingTorqueSource {
    fn swing_torques(&mut self, state: &RobotState, contacts: &ContactSet) -> JointTorqueCommand;
}

/// Outcome of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub time: Float,
    /// Mode after the tick
    pub mode: LoopMode,
    /// Body PID output
    pub wrench: Wrench,
    /// Wrench handed to the allocator, gravity compensation included
    pub target: Wrench,
    pub allocation: Option<Allocation>,
    /// Command sent to the simulator
    pub command: JointTorqueCommand,
    pub fault: Option<ControlError>,
}

pub struct ControlLoop {
    config: ControllerConfig,
    kinematics: Box<dyn Kinematics>,
    pid: BodyPid,
    memory: PidState,
    allocator: ForceAllocator,
    mapper: TorqueMapper,
    weight_s: Vector6<Float>,
    weight_r: ForceWeight,
    mode: LoopMode,
    source: Option<Box<dyn TrajectorySource>>,
    swing: Option<Box<dyn SwingTorqueSource>>,
    last_command: Option<JointTorqueCommand>,
    tick: u64,
    time: Float,
    telemetry: Telemetry,
}

impl ControlLoop {
    /// Loop for the configured quadruped, solving with Clarabel
    pub fn new(config: ControllerConfig) -> Result<Self, ConfigError> {
        let kinematics = Box::new(QuadrupedKinematics::new(&config.robot));
        let solver = Box::new(ClarabelSolver::new(&config.solver));
        Self::with_parts(config, kinematics, solver)
    }

    pub fn with_parts(
        config: ControllerConfig,
        kinematics: Box<dyn Kinematics>,
        solver: Box<dyn QpSolver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let telemetry = Telemetry::new(config.control.telemetry_capacity, kinematics.num_joints());
        Ok(ControlLoop {
            pid: BodyPid::new(&config.pid, &config.robot),
            memory: PidState::new(),
            allocator: ForceAllocator::with_solver(solver, &config.qp, &config.solver),
            mapper: TorqueMapper::new(config.control.singular_threshold),
            weight_s: config.qp.weight_s(),
            weight_r: ForceWeight::new(&config.qp),
            mode: LoopMode::Idle,
            source: None,
            swing: None,
            last_command: None,
            tick: 0,
            time: 0.,
            telemetry,
            kinematics,
            config,
        })
    }

    pub fn mode(&self) -> LoopMode {
        self.mode
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn kinematics(&self) -> &dyn Kinematics {
        self.kinematics.as_ref()
    }

    pub fn pid_state(&self) -> &PidState {
        &self.memory
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn last_command(&self) -> Option<&JointTorqueCommand> {
        self.last_command.as_ref()
    }

    pub fn time(&self) -> Float {
        self.time
    }

    pub fn set_swing_source(&mut self, swing: Box<dyn SwingTorqueSource>) {
        self.swing = Some(swing);
    }

    /// Idle → Running with the given reference source. PID memory starts
    /// from zero.
    pub fn start(&mut self, source: Box<dyn TrajectorySource>) -> Result<(), ControlError> {
        if self.mode != LoopMode::Idle {
            return Err(ControlError::invalid_input(format!(
                "start requires Idle, loop is {}",
                self.mode
            )));
        }
        self.source = Some(source);
        self.memory.reset();
        self.last_command = None;
        self.mode = LoopMode::Running;
        info!(time = self.time, "control loop started");
        Ok(())
    }

    /// Back to Idle, dropping the reference source
    pub fn stop(&mut self) {
        if self.mode != LoopMode::Idle {
            info!(time = self.time, "control loop stopped from {}", self.mode);
        }
        self.source = None;
        self.mode = LoopMode::Idle;
    }

    /// Clear PID memory. A faulted loop resumes running.
    pub fn reset(&mut self) {
        self.memory.reset();
        if self.mode == LoopMode::Faulted {
            self.mode = LoopMode::Running;
        }
        info!(time = self.time, "control loop reset, now {}", self.mode);
    }

    /// Replace all parameters. Only allowed while Idle.
    pub fn reconfigure(&mut self, config: ControllerConfig) -> Result<(), ControlError> {
        if self.mode != LoopMode::Idle {
            return Err(ControlError::invalid_input(format!(
                "reconfigure requires Idle, loop is {}",
                self.mode
            )));
        }
        config
            .validate()
            .map_err(|e| ControlError::invalid_input(e.to_string()))?;

        self.pid = BodyPid::new(&config.pid, &config.robot);
        self.memory.reset();
        self.allocator.reconfigure(&config.qp, &config.solver);
        self.mapper = TorqueMapper::new(config.control.singular_threshold);
        self.weight_s = config.qp.weight_s();
        self.weight_r = ForceWeight::new(&config.qp);
        if config.control.telemetry_capacity != self.config.control.telemetry_capacity {
            self.telemetry = Telemetry::new(
                config.control.telemetry_capacity,
                self.kinematics.num_joints(),
            );
        }
        self.config = config;
        info!("control loop reconfigured");
        Ok(())
    }

    /// Run one control tick of length `dt`
    pub fn tick(&mut self, sim: &mut dyn Simulator, dt: Float) -> Result<TickReport, ControlError> {
        if self.mode == LoopMode::Idle {
            return Err(ControlError::NotRunning {
                mode: self.mode.to_string(),
            });
        }
        if !(dt > 0. && dt.is_finite()) {
            return Err(ControlError::invalid_input(format!(
                "tick duration must be positive, got {}",
                dt
            )));
        }

        let Observation { state, contacts } = sim.observe();
        self.check_state(&state)?;

        // A faulted loop keeps emitting the fallback until reset
        let (wrench, target, outcome) = if self.mode == LoopMode::Faulted {
            (Wrench::zero(), Wrench::zero(), None)
        } else {
            let reference = match self.source.as_mut() {
                Some(source) => source.desired(self.time, &state),
                None => DesiredTrajectory::hold(state.pose),
            };
            let wrench = self.pid.compute_desired_wrench(
                &mut self.memory,
                &state.pose,
                &state.twist,
                &reference,
                dt,
            )?;
            let target = self.gravity_compensated(&wrench);
            (wrench, target, Some(self.balance(&state, &contacts, &target)))
        };

        let (command, allocation, fault) = match outcome {
            None => (self.fallback_command(), None, None),
            Some(Ok((command, allocation))) => {
                self.last_command = Some(command.clone());
                (command, Some(allocation), None)
            }
            Some(Err(e)) if e.is_recoverable() => {
                warn!(tick = self.tick, time = self.time, "falling back: {}", e);
                self.mode = LoopMode::Faulted;
                (self.fallback_command(), None, Some(e))
            }
            Some(Err(e)) => return Err(e),
        };

        sim.actuate(&command, dt);

        debug!(
            tick = self.tick,
            mode = %self.mode,
            fz = target.linear.z,
            iterations = ?allocation.as_ref().map(|a| a.iterations),
            "tick"
        );
        self.telemetry.record(TickRecord {
            tick: self.tick,
            time: self.time,
            mode: self.mode,
            reference_wrench: target,
            forces: allocation
                .as_ref()
                .map(|a| a.forces.to_vector())
                .unwrap_or_else(|| DVector::zeros(3 * NUM_LEGS)),
            torques: command.tau.clone(),
            contacts: contacts.flags(),
            solve_time: allocation.as_ref().map(|a| a.solve_time),
            fault: fault.as_ref().map(|e| e.to_string()),
        });

        let report = TickReport {
            tick: self.tick,
            time: self.time,
            mode: self.mode,
            wrench,
            target,
            allocation,
            command,
            fault,
        };
        self.tick += 1;
        self.time += dt;
        Ok(report)
    }

    /// Run `ticks` ticks back to back at the configured rate
    pub fn run(
        &mut self,
        sim: &mut dyn Simulator,
        ticks: usize,
    ) -> Result<TelemetrySummary, ControlError> {
        let dt = self.config.control.dt();
        for _ in 0..ticks {
            self.tick(sim, dt)?;
        }
        self.telemetry.log_summary();
        Ok(self.telemetry.summary())
    }

    fn check_state(&self, state: &RobotState) -> Result<(), ControlError> {
        let n = self.kinematics.num_joints();
        if state.q.len() != n || state.v.len() != n {
            return Err(ControlError::invalid_input(format!(
                "expected {} joint positions and velocities, got {} and {}",
                n,
                state.q.len(),
                state.v.len()
            )));
        }
        let finite = state
            .q
            .iter()
            .chain(state.v.iter())
            .chain(state.pose.translation.iter())
            .chain(state.pose.rotation.coords.iter())
            .chain(state.twist.linear.iter())
            .chain(state.twist.angular.iter())
            .all(|x| x.is_finite());
        if !finite {
            return Err(ControlError::invalid_input("robot state is not finite"));
        }
        Ok(())
    }

    fn gravity_compensated(&self, wrench: &Wrench) -> Wrench {
        let mut target = *wrench;
        if self.config.control.gravity_compensation {
            target.linear.z += self.config.robot.mass * GRAVITY;
        }
        target
    }

    /// Allocation and torque mapping for the current stance set
    fn balance(
        &mut self,
        state: &RobotState,
        contacts: &ContactSet,
        target: &Wrench,
    ) -> Result<(JointTorqueCommand, Allocation), ControlError> {
        let feet = stance_feet(self.kinematics.as_ref(), state, contacts);
        let allocation = self.allocator.allocate(
            target,
            &feet,
            self.config.qp.mu,
            &self.weight_s,
            &self.weight_r,
        )?;
        let mut command = self
            .mapper
            .map_to_joint_torques(&allocation.forces, state, self.kinematics.as_ref())?
            .into_command()?;

        if let Some(swing) = self.swing.as_mut() {
            let swing_torques = swing.swing_torques(state, contacts);
            if swing_torques.len() != command.len() {
                return Err(ControlError::invalid_input(format!(
                    "swing source gave {} torques for {} joints",
                    swing_torques.len(),
                    command.len()
                )));
            }
            for leg in LegId::ALL.into_iter().filter(|leg| !contacts.in_stance(*leg)) {
                for joint in self.kinematics.leg_joints(leg) {
                    command.tau[joint] = swing_torques.tau[joint];
                }
            }
        }

        if !command.is_finite() {
            return Err(ControlError::Unsolvable {
                reason: "non-finite joint torques".to_string(),
            });
        }
        Ok((command, allocation))
    }

    fn fallback_command(&self) -> JointTorqueCommand {
        let zero = JointTorqueCommand::zeros(self.kinematics.num_joints());
        match self.config.control.fallback {
            FallbackPolicy::Zero => zero,
            FallbackPolicy::HoldPrevious => self
                .last_command
                .clone()
                .filter(|c| c.is_finite())
                .unwrap_or(zero),
        }
    }
}

#[cfg(test)]
mod driver_tests {
    use na::vector;

    use crate::{
        assert_close, assert_vec_close,
        config::RobotConfig,
        control::qp::{QpProblem, QpSolution},
        error::QpError,
        robot::NUM_JOINTS,
    };

    use super::*;

    /// Holds a fixed observation and records every command it receives
    struct FakeSimulator {
        observation: Observation,
        commands: Vec<JointTorqueCommand>,
    }

    impl FakeSimulator {
        fn standing(contacts: ContactSet) -> Self {
            let robot = RobotConfig::default();
            let kinematics = QuadrupedKinematics::new(&robot);
            let q = kinematics
                .standing_joint_positions(robot.nominal_height)
                .unwrap();
            let pose = Pose::from_translation(vector![0., 0., robot.nominal_height]);
            FakeSimulator {
                observation: Observation {
                    state: RobotState::standing(q, pose),
                    contacts,
                },
                commands: vec![],
            }
        }
    }

    impl Simulator for FakeSimulator {
        fn observe(&mut self) -> Observation {
            self.observation.clone()
        }

        fn actuate(&mut self, command: &JointTorqueCommand, _dt: Float) {
            self.commands.push(command.clone());
        }
    }

    struct Unconverged;

    impl QpSolver for Unconverged {
        fn solve(&self, _problem: &QpProblem) -> Result<QpSolution, QpError> {
            Err(QpError::Unsolvable {
                status: "MaxTime".into(),
            })
        }
    }

    struct ConstantSwing(Float);

    impl SwingTorqueSource for ConstantSwing {
        fn swing_torques(&mut self, _state: &RobotState, _contacts: &ContactSet) -> JointTorqueCommand {
            JointTorqueCommand {
                tau: DVector::from_element(NUM_JOINTS, self.0),
            }
        }
    }

    fn config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.solver.time_limit = 1.0;
        config.solver.max_iter = 100;
        config
    }

    fn started(config: ControllerConfig, sim: &FakeSimulator) -> ControlLoop {
        let mut control = ControlLoop::new(config).unwrap();
        control
            .start(Box::new(FixedSetpoint::hold(sim.observation.state.pose)))
            .unwrap();
        control
    }

    #[test]
    fn standing_tick_supports_weight() {
        // Arrange
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = started(config(), &sim);
        let weight = control.config().robot.weight();

        // Act
        let report = control.tick(&mut sim, 0.005).unwrap();

        // Assert
        assert_eq!(report.mode, LoopMode::Running);
        assert!(report.fault.is_none());
        assert_close!(report.wrench.to_vector().norm(), 0.0, 1e-9);
        assert_close!(report.target.linear.z, weight, 1e-9);
        let allocation = report.allocation.unwrap();
        for (_, f) in allocation.forces.iter() {
            assert_vec_close!(f, &vector![0., 0., weight / 4.], 1e-2);
        }
        assert_eq!(sim.commands.len(), 1);
        assert_eq!(sim.commands[0], report.command);
        assert!(report.command.tau.norm() > 0.);
    }

    #[test]
    fn no_stance_feet_faults_with_zero_command() {
        // Arrange
        let mut sim = FakeSimulator::standing(ContactSet::none());
        let mut control = started(config(), &sim);

        // Act
        let report = control.tick(&mut sim, 0.005).unwrap();

        // Assert
        assert_eq!(report.mode, LoopMode::Faulted);
        assert_eq!(control.mode(), LoopMode::Faulted);
        assert!(matches!(report.fault, Some(ControlError::Infeasible { .. })));
        assert_eq!(report.command, JointTorqueCommand::zeros(NUM_JOINTS));
        assert_eq!(sim.commands.len(), 1);
        assert_eq!(control.telemetry().summary().faults, 1);
    }

    #[test]
    fn faulted_loop_holds_fallback_until_reset() {
        // Arrange
        let mut sim = FakeSimulator::standing(ContactSet::none());
        let mut control = started(config(), &sim);
        control.tick(&mut sim, 0.005).unwrap();

        // Act: contacts come back but the loop stays faulted
        sim.observation.contacts = ContactSet::all_stance();
        let held = control.tick(&mut sim, 0.005).unwrap();
        control.reset();
        let resumed = control.tick(&mut sim, 0.005).unwrap();

        // Assert
        assert_eq!(held.mode, LoopMode::Faulted);
        assert!(held.fault.is_none());
        assert!(held.allocation.is_none());
        assert_eq!(resumed.mode, LoopMode::Running);
        assert!(resumed.allocation.is_some());
    }

    #[test]
    fn reset_clears_pid_memory_and_keeps_running() {
        // Arrange: reference 5 cm above the torso
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut raised = sim.observation.state.pose;
        raised.translation.z += 0.05;
        let mut control = ControlLoop::new(config()).unwrap();
        control.start(Box::new(FixedSetpoint::hold(raised))).unwrap();
        control.tick(&mut sim, 0.005).unwrap();
        assert!(control.pid_state().integral()[2] > 0.);
        assert!(control.pid_state().prev_error().is_some());

        // Act
        control.reset();

        // Assert
        assert_eq!(control.pid_state(), &PidState::new());
        assert_eq!(control.mode(), LoopMode::Running);
    }

    #[test]
    fn hold_previous_repeats_last_good_command() {
        // Arrange
        let mut config = config();
        config.control.fallback = FallbackPolicy::HoldPrevious;
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = started(config, &sim);
        let good = control.tick(&mut sim, 0.005).unwrap();

        // Act
        sim.observation.contacts = ContactSet::none();
        let fallback = control.tick(&mut sim, 0.005).unwrap();

        // Assert
        assert_eq!(fallback.mode, LoopMode::Faulted);
        assert_eq!(fallback.command, good.command);
        assert_eq!(control.last_command(), Some(&good.command));
    }

    #[test]
    fn solver_timeout_faults() {
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let config = config();
        let kinematics = Box::new(QuadrupedKinematics::new(&config.robot));
        let mut control = ControlLoop::with_parts(config, kinematics, Box::new(Unconverged)).unwrap();
        control
            .start(Box::new(FixedSetpoint::hold(sim.observation.state.pose)))
            .unwrap();

        let report = control.tick(&mut sim, 0.005).unwrap();

        assert!(matches!(report.fault, Some(ControlError::Unsolvable { .. })));
        assert!(report.command.is_finite());
    }

    #[test]
    fn singular_stance_leg_faults() {
        // Arrange: front right leg stretched straight
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        sim.observation.state.q.rows_mut(0, 3).fill(0.);
        let mut control = started(config(), &sim);

        // Act
        let report = control.tick(&mut sim, 0.005).unwrap();

        // Assert
        assert!(matches!(
            report.fault,
            Some(ControlError::DegenerateGeometry { ref legs }) if legs == &vec![LegId::FrontRight]
        ));
        assert_eq!(report.mode, LoopMode::Faulted);
    }

    #[test]
    fn idle_loop_refuses_to_tick() {
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = ControlLoop::new(config()).unwrap();

        let result = control.tick(&mut sim, 0.005);

        assert!(matches!(result, Err(ControlError::NotRunning { .. })));
        assert!(sim.commands.is_empty());
    }

    #[test]
    fn contract_violations_are_returned() {
        // Arrange
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = started(config(), &sim);

        // Act
        let bad_dt = control.tick(&mut sim, 0.0);
        sim.observation.state.q = DVector::zeros(7);
        let bad_state = control.tick(&mut sim, 0.005);

        // Assert
        assert!(matches!(bad_dt, Err(ControlError::InvalidInput { .. })));
        assert!(matches!(bad_state, Err(ControlError::InvalidInput { .. })));
        assert_eq!(control.mode(), LoopMode::Running);
        assert!(sim.commands.is_empty());
    }

    #[test]
    fn reconfigure_only_when_idle() {
        // Arrange
        let sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = started(config(), &sim);
        let mut changed = config();
        changed.qp.mu = 0.4;

        // Act
        let while_running = control.reconfigure(changed.clone());
        control.stop();
        let while_idle = control.reconfigure(changed);

        // Assert
        assert!(while_running.is_err());
        assert!(while_idle.is_ok());
        assert_close!(control.config().qp.mu, 0.4, 1e-12);
        assert_eq!(control.mode(), LoopMode::Idle);
    }

    #[test]
    fn invalid_reconfiguration_is_rejected() {
        let mut control = ControlLoop::new(config()).unwrap();
        let mut bad = config();
        bad.robot.mass = -1.;

        assert!(control.reconfigure(bad).is_err());
        assert_close!(control.config().robot.mass, RobotConfig::default().mass, 1e-12);
    }

    #[test]
    fn swing_legs_take_swing_torques() {
        // Arrange
        let contacts = ContactSet::from_flags([true, false, false, true]);
        let mut sim = FakeSimulator::standing(contacts);
        let mut control = started(config(), &sim);
        control.set_swing_source(Box::new(ConstantSwing(0.25)));

        // Act
        let report = control.tick(&mut sim, 0.005).unwrap();

        // Assert
        let tau = &report.command.tau;
        for leg in [LegId::FrontLeft, LegId::BackRight] {
            for joint in control.kinematics().leg_joints(leg) {
                assert_close!(tau[joint], 0.25, 1e-12);
            }
        }
        for joint in control.kinematics().leg_joints(LegId::FrontRight) {
            assert!(tau[joint] != 0.25);
        }
    }

    #[test]
    fn run_advances_time_at_tick_rate() {
        let mut sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = started(config(), &sim);

        let summary = control.run(&mut sim, 10).unwrap();

        assert_eq!(summary.ticks, 10);
        assert_eq!(summary.faults, 0);
        assert_close!(control.time(), 10. * control.config().control.dt(), 1e-12);
        assert_eq!(sim.commands.len(), 10);
        assert_eq!(control.telemetry().len(), 10);
    }

    #[test]
    fn start_requires_idle() {
        let sim = FakeSimulator::standing(ContactSet::all_stance());
        let mut control = started(config(), &sim);

        let again = control.start(Box::new(FixedSetpoint::hold(Pose::identity())));

        assert!(matches!(again, Err(ControlError::InvalidInput { .. })));
    }
}
