use std::ops::{Add, AddAssign, Sub, SubAssign};

use na::{Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::types::Float;

/// A wrench represents a system of forces acting on the torso.
/// It is expressed in the world frame, with torques taken about the torso
/// center of mass:
///     w = (τ f) = ∑ over j (r_j \cross f_j   f_j)
/// where the f_j are forces exerted at positions r_j relative to the COM.
///
/// As a flat vector the ordering is linear first: (fx fy fz τx τy τz).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Wrench {
    pub angular: Vector3<Float>,
    pub linear: Vector3<Float>,
}

impl Wrench {
    pub fn zero() -> Self {
        Wrench {
            angular: Vector3::zeros(),
            linear: Vector3::zeros(),
        }
    }

    pub fn new(linear: Vector3<Float>, angular: Vector3<Float>) -> Self {
        Wrench { angular, linear }
    }

    /// Return the wrench of a force applied at point
    pub fn from_force(point: &Vector3<Float>, force: &Vector3<Float>) -> Self {
        Wrench {
            angular: point.cross(force),
            linear: *force,
        }
    }

    pub fn to_vector(&self) -> Vector6<Float> {
        let mut v = Vector6::zeros();
        v.fixed_rows_mut::<3>(0).copy_from(&self.linear);
        v.fixed_rows_mut::<3>(3).copy_from(&self.angular);
        v
    }

    pub fn from_vector(v: &Vector6<Float>) -> Self {
        Wrench {
            linear: v.fixed_rows::<3>(0).into(),
            angular: v.fixed_rows::<3>(3).into(),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.linear.iter().chain(self.angular.iter()).all(|x| x.is_finite())
    }
}

impl<'a, 'b> Add<&'b Wrench> for &'a Wrench {
    type Output = Wrench;

    fn add(self, rhs: &Wrench) -> Wrench {
        Wrench {
            angular: self.angular + rhs.angular,
            linear: self.linear + rhs.linear,
        }
    }
}

impl Add for Wrench {
    type Output = Wrench;

    fn add(self, rhs: Wrench) -> Wrench {
        &self + &rhs
    }
}

impl AddAssign for Wrench {
    fn add_assign(&mut self, rhs: Self) {
        self.angular += rhs.angular;
        self.linear += rhs.linear;
    }
}

impl<'a, 'b> Sub<&'b Wrench> for &'a Wrench {
    type Output = Wrench;

    fn sub(self, rhs: &Wrench) -> Wrench {
        Wrench {
            angular: self.angular - rhs.angular,
            linear: self.linear - rhs.linear,
        }
    }
}

impl SubAssign<&Wrench> for Wrench {
    fn sub_assign(&mut self, rhs: &Wrench) {
        self.angular -= rhs.angular;
        self.linear -= rhs.linear;
    }
}

#[cfg(test)]
mod wrench_tests {
    use na::vector;

    use crate::assert_vec_close;

    use super::*;

    #[test]
    fn vector_ordering_is_linear_first() {
        let w = Wrench::new(vector![1., 2., 3.], vector![4., 5., 6.]);

        let v = w.to_vector();

        assert_vec_close!(&v, &vector![1., 2., 3., 4., 5., 6.], 1e-12);
        assert_eq!(Wrench::from_vector(&v), w);
    }

    #[test]
    fn forces_at_points_sum_into_wrench() {
        // Arrange
        let up = vector![0., 0., 10.];
        let front = vector![0.5, 0., -0.3];
        let back = vector![-0.5, 0., -0.3];

        // Act
        let total = Wrench::from_force(&front, &up) + Wrench::from_force(&back, &up);

        // Assert
        assert_vec_close!(&total.linear, &vector![0., 0., 20.], 1e-12);
        assert_vec_close!(&total.angular, &Vector3::<Float>::zeros(), 1e-12);
    }

    #[test]
    fn sub_undoes_add() {
        let a = Wrench::new(vector![1., -2., 3.], vector![0.1, 0.2, -0.3]);
        let b = Wrench::new(vector![0.5, 0.5, 0.5], vector![1., 1., 1.]);

        let mut c = &a + &b;
        c -= &b;

        assert_vec_close!(&c.to_vector(), &a.to_vector(), 1e-12);
        assert!(!Wrench::new(vector![Float::NAN, 0., 0.], Vector3::zeros()).is_finite());
    }
}
