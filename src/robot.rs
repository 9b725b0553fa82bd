//! Per-tick data exchanged between the simulator, the trajectory source and
//! the balance controller.

use std::fmt;

use na::{DVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    spatial::{
        pose::Pose,
        twist::{SpatialAcceleration, Twist},
    },
    types::Float,
};

/// Number of actuated joints per leg: abduction, hip, knee
pub const JOINTS_PER_LEG: usize = 3;
pub const NUM_LEGS: usize = 4;
pub const NUM_JOINTS: usize = JOINTS_PER_LEG * NUM_LEGS;

/// Legs in the order their joints appear in joint vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LegId {
    FrontRight,
    FrontLeft,
    BackRight,
    BackLeft,
}

impl LegId {
    pub const ALL: [LegId; NUM_LEGS] = [
        LegId::FrontRight,
        LegId::FrontLeft,
        LegId::BackRight,
        LegId::BackLeft,
    ];

    pub fn index(&self) -> usize {
        match self {
            LegId::FrontRight => 0,
            LegId::FrontLeft => 1,
            LegId::BackRight => 2,
            LegId::BackLeft => 3,
        }
    }

    pub fn is_front(&self) -> bool {
        matches!(self, LegId::FrontRight | LegId::FrontLeft)
    }

    pub fn is_left(&self) -> bool {
        matches!(self, LegId::FrontLeft | LegId::BackLeft)
    }
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LegId::FrontRight => "FR",
            LegId::FrontLeft => "FL",
            LegId::BackRight => "BR",
            LegId::BackLeft => "BL",
        };
        write!(f, "{}", name)
    }
}

/// Map from leg to value, with one slot per leg. Iteration follows `LegId::ALL`.
#[derive(Debug, Clone, PartialEq)]
pub struct LegMap<T> {
    slots: [Option<T>; NUM_LEGS],
}

impl<T> LegMap<T> {
    pub fn new() -> Self {
        LegMap {
            slots: [None, None, None, None],
        }
    }

    pub fn from_fn(mut f: impl FnMut(LegId) -> T) -> Self {
        let mut map = LegMap::new();
        for leg in LegId::ALL {
            map.insert(leg, f(leg));
        }
        map
    }

    pub fn insert(&mut self, leg: LegId, value: T) -> Option<T> {
        self.slots[leg.index()].replace(value)
    }

    pub fn remove(&mut self, leg: LegId) -> Option<T> {
        self.slots[leg.index()].take()
    }

    pub fn get(&self, leg: LegId) -> Option<&T> {
        self.slots[leg.index()].as_ref()
    }

    pub fn contains(&self, leg: LegId) -> bool {
        self.slots[leg.index()].is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn legs(&self) -> impl Iterator<Item = LegId> + '_ {
        self.iter().map(|(leg, _)| leg)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LegId, &T)> {
        LegId::ALL
            .into_iter()
            .zip(self.slots.iter())
            .filter_map(|(leg, slot)| slot.as_ref().map(|value| (leg, value)))
    }
}

impl<T> Default for LegMap<T> {
    fn default() -> Self {
        LegMap::new()
    }
}

/// Measured robot state, produced once per tick by the simulator.
///
/// Joint vectors follow the `LegId` order, `JOINTS_PER_LEG` entries per leg.
/// Pose and twist are those of the torso, in the world frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    pub q: DVector<Float>,
    pub v: DVector<Float>,
    pub pose: Pose,
    pub twist: Twist,
}

impl RobotState {
    pub fn standing(q: DVector<Float>, pose: Pose) -> Self {
        let n = q.len();
        RobotState {
            q,
            v: DVector::zeros(n),
            pose,
            twist: Twist::zero(),
        }
    }
}

/// Contact of one leg with the ground
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    /// Unit outward surface normal at the foot, world frame
    pub normal: Vector3<Float>,
}

/// Which legs are in stance this tick. Legs absent from the map are swinging.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContactSet {
    contacts: LegMap<Contact>,
}

impl ContactSet {
    pub fn none() -> Self {
        ContactSet {
            contacts: LegMap::new(),
        }
    }

    /// All four legs in stance on a flat floor
    pub fn all_stance() -> Self {
        Self::from_legs(&LegId::ALL, &Vector3::z())
    }

    pub fn from_legs(legs: &[LegId], normal: &Vector3<Float>) -> Self {
        let mut set = ContactSet::none();
        for leg in legs {
            set.set_stance(*leg, *normal);
        }
        set
    }

    pub fn from_flags(flags: [bool; NUM_LEGS]) -> Self {
        let legs: Vec<LegId> = LegId::ALL
            .into_iter()
            .zip(flags)
            .filter_map(|(leg, in_stance)| in_stance.then_some(leg))
            .collect();
        Self::from_legs(&legs, &Vector3::z())
    }

    /// Normals are normalized on insertion.
    pub fn set_stance(&mut self, leg: LegId, normal: Vector3<Float>) {
        self.contacts.insert(
            leg,
            Contact {
                normal: normal.normalize(),
            },
        );
    }

    pub fn set_swing(&mut self, leg: LegId) {
        self.contacts.remove(leg);
    }

    pub fn in_stance(&self, leg: LegId) -> bool {
        self.contacts.contains(leg)
    }

    pub fn contact(&self, leg: LegId) -> Option<&Contact> {
        self.contacts.get(leg)
    }

    pub fn stance_legs(&self) -> Vec<LegId> {
        self.contacts.legs().collect()
    }

    pub fn num_stance(&self) -> usize {
        self.contacts.len()
    }

    pub fn flags(&self) -> [bool; NUM_LEGS] {
        LegId::ALL.map(|leg| self.in_stance(leg))
    }
}

/// Reference for the torso, supplied externally each tick
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredTrajectory {
    pub pose: Pose,
    pub twist: Twist,
    pub acceleration: SpatialAcceleration,
}

impl DesiredTrajectory {
    /// Hold the given pose at rest
    pub fn hold(pose: Pose) -> Self {
        DesiredTrajectory {
            pose,
            twist: Twist::zero(),
            acceleration: SpatialAcceleration::zero(),
        }
    }
}

/// Ground-reaction forces on the stance feet, world frame
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FootForceSet {
    forces: LegMap<Vector3<Float>>,
}

impl FootForceSet {
    pub fn new() -> Self {
        FootForceSet {
            forces: LegMap::new(),
        }
    }

    pub fn insert(&mut self, leg: LegId, force: Vector3<Float>) {
        self.forces.insert(leg, force);
    }

    pub fn get(&self, leg: LegId) -> Option<&Vector3<Float>> {
        self.forces.get(leg)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LegId, &Vector3<Float>)> {
        self.forces.iter()
    }

    pub fn len(&self) -> usize {
        self.forces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forces.is_empty()
    }

    pub fn total_force(&self) -> Vector3<Float> {
        self.iter().fold(Vector3::zeros(), |acc, (_, f)| acc + f)
    }

    /// Forces of all four legs stacked in `LegId` order, zero for legs
    /// without a force
    pub fn to_vector(&self) -> DVector<Float> {
        let mut out = DVector::zeros(3 * NUM_LEGS);
        for (leg, force) in self.iter() {
            out.fixed_rows_mut::<3>(3 * leg.index()).copy_from(force);
        }
        out
    }
}

/// One torque per actuated joint, in the joint order of `RobotState`
#[derive(Debug, Clone, PartialEq)]
pub struct JointTorqueCommand {
    pub tau: DVector<Float>,
}

impl JointTorqueCommand {
    pub fn zeros(n: usize) -> Self {
        JointTorqueCommand {
            tau: DVector::zeros(n),
        }
    }

    pub fn len(&self) -> usize {
        self.tau.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tau.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.tau.iter().all(|x| x.is_finite())
    }
}
