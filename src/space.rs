//! This module defines the vector arithmetic shared by the engines for data points that
//! belong to R^n.
//!  - the Euclidian distance function (and its square)
//!  - coordinate-wise addition, subtraction, scaling and averaging

/// A point in R^n.
pub type RealPoint = Vec<f64>;

/// Computes the squared Euclidian distance in R^n.
pub fn sq_dist(p1: &RealPoint, p2: &RealPoint) -> f64 {
    p1.iter()
        .zip(p2)
        .map(|(x1, x2)| {
            let d = x1 - x2;
            d * d
        })
        .sum()
}

/// Computes the Euclidian distance in R^n.
pub fn euclid_dist(p1: &RealPoint, p2: &RealPoint) -> f64 {
    sq_dist(p1, p2).sqrt()
}

pub fn add(p1: &RealPoint, p2: &RealPoint) -> RealPoint {
    p1.iter().zip(p2).map(|(x1, x2)| x1 + x2).collect()
}

pub fn sub(p1: &RealPoint, p2: &RealPoint) -> RealPoint {
    p1.iter().zip(p2).map(|(x1, x2)| x1 - x2).collect()
}

pub fn scale(p: &RealPoint, factor: f64) -> RealPoint {
    p.iter().map(|x| x * factor).collect()
}

/// Computes the middle of two points.
pub fn average(p1: &RealPoint, p2: &RealPoint) -> RealPoint {
    scale(&add(p1, p2), 0.5)
}

/// Computes the coordinate-wise mean of a non empty set of points.
pub fn mean<'a>(mut points: impl Iterator<Item = &'a RealPoint>) -> Option<RealPoint> {
    let first = points.next()?.clone();
    let (sum, count) = points.fold((first, 1usize), |(sum, count), p| (add(&sum, p), count + 1));
    Some(scale(&sum, 1. / count as f64))
}
