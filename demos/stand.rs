use std::error::Error;

use quadruped_balance::{
    config::ControllerConfig,
    driver::{ControlLoop, FixedSetpoint},
    na::vector,
    sim::{CentroidalSimulator, Push},
    types::Float,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Stand still for three seconds, with a sideways shove at t = 1 s.
///
/// Usage: stand [config.toml]
///
/// The default solver deadline assumes an optimized build. Run with
/// `--release`, or raise `solver.time_limit` in the config, otherwise most
/// ticks fault on the deadline.
pub fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ControllerConfig::from_file(path)?,
        None => ControllerConfig::default(),
    };

    let mut sim = CentroidalSimulator::standing(&config.robot);
    sim.add_push(Push {
        start: 1.0,
        duration: 0.1,
        force: vector![0., 15., 0.],
    });

    let final_time: Float = 3.0;
    let dt = config.control.dt();
    let ticks = (final_time * config.control.tick_rate) as usize;
    let setpoint = FixedSetpoint::hold(*sim.pose());

    let mut control = ControlLoop::new(config)?;
    control.start(Box::new(setpoint))?;

    let report_every = ticks / 10;
    for i in 0..ticks {
        let report = control.tick(&mut sim, dt)?;
        if report.fault.is_some() {
            control.reset();
        }
        if report_every > 0 && i % report_every == 0 {
            let p = sim.pose().translation;
            info!(
                t = sim.time(),
                x = p.x,
                y = p.y,
                z = p.z,
                mode = %report.mode,
                "torso"
            );
        }
    }

    info!("{}", control.telemetry().summary());
    Ok(())
}
