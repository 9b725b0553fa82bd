use na::{Matrix3, Matrix4x3, Quaternion, UnitQuaternion, Vector3};

use crate::types::Float;

/// Cross-product matrix of v, i.e. skew_symmetric(v) * u == v x u
pub fn skew_symmetric(v: &Vector3<Float>) -> Matrix3<Float> {
    #[rustfmt::skip]
    let mat = Matrix3::new(
         0.0, -v.z,  v.y,
         v.z,  0.0, -v.x,
        -v.y,  v.x,  0.0,
    );
    mat
}

/// Compute the derivative of quaternion, given angular velocity:
/// qdot = 1/2 * q \quaternion_product ω,
/// where q is orientation as quaternion, and ω is angular velocity in body frame
///
/// Ref: 1.5.2 & 1.5.4 in Quaternions and Dynamics, Basile Graf, 2007
pub fn quaternion_derivative(
    q: &UnitQuaternion<Float>,
    omega: &Vector3<Float>,
) -> Quaternion<Float> {
    let w = q.w;
    let x = q.coords.x;
    let y = q.coords.y;
    let z = q.coords.z;

    #[rustfmt::skip]
    let mat = Matrix4x3::new(
        -x, -y, -z,
         w, -z,  y,
         z,  w, -x,
        -y,  x,  w,
    ) / 2.0;

    let quaternion_dot = mat * omega;
    Quaternion::from_parts(quaternion_dot[0], quaternion_dot.fixed_view::<3, 1>(1, 0))
}

/// Orthonormal tangent basis (t1, t2) of the plane perpendicular to n.
/// (t1, t2, n) forms a right-handed frame.
pub fn tangent_basis(n: &Vector3<Float>) -> (Vector3<Float>, Vector3<Float>) {
    let seed = if n.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let t1 = (seed - n * n.dot(&seed)).normalize();
    let t2 = n.cross(&t1);
    (t1, t2)
}

#[macro_export]
macro_rules! assert_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        let diff = (left - right).abs();
        if diff > tol {
            panic!(
                "assertion failed: {} ~= {} \
                (tolerance: {}, difference: {})",
                left, right, tol, diff
            );
        }
    };
}

#[macro_export]
macro_rules! assert_vec_close {
    ($left:expr, $right:expr, $tolerance:expr) => {
        let left = $left;
        let right = $right;
        let tol = $tolerance;
        assert_eq!(left.len(), right.len(), "length mismatch");
        for (a, b) in left.iter().zip(right.iter()) {
            $crate::assert_close!(*a, *b, tol);
        }
    };
}
