use std::{cmp::Ordering, ops::Deref};

/// A neighbor identifier and its distance from some point in space.
#[derive(PartialEq, Debug, Clone)]
pub struct NeighborDist<Id>(Id, f64);

impl<Id> NeighborDist<Id> {
    /// Builds a new instance.
    pub fn new(id: Id, dist: f64) -> Self {
        Self(id, dist)
    }

    /// The neighbor identifier
    pub fn id(&self) -> &Id {
        &self.0
    }

    /// The distance to some other point
    pub fn dist(&self) -> f64 {
        self.1
    }

    /// Consumes the instance and returns the identifier.
    pub fn into_id(self) -> Id {
        self.0
    }
}

/// Defines nearest neighbors getter functions.
///
/// This trait is implemented by iterators over `(id, point)` couples that represent a set
/// of points in some space.
pub trait GetNeighborhood<Id, Point, Dist>
where
    Dist: Fn(&Point, &Point) -> f64,
{
    /// Get the `k` nearest neighbors ordered by their distance from the given point,
    /// identifiers breaking ties so that the ranking is deterministic.
    /// ```
    /// use fluent_detect::space;
    /// use fluent_detect::neighbors::*;
    ///
    /// let centers = vec![vec![1., 1.], vec![3.5, -1.6], vec![2.4, 4.], vec![-0.5, 1.]];
    /// let point = &vec![0., 0.];
    /// let nn = centers
    ///     .iter()
    ///     .enumerate()
    ///     .get_neighborhood(point, 2, space::sq_dist);
    /// assert_eq!(vec![NeighborDist::new(3, 1.25), NeighborDist::new(0, 2.)], nn);
    /// ```
    fn get_neighborhood(&mut self, point: &Point, k: usize, dist: Dist) -> Vec<NeighborDist<Id>>;

    /// Get the nearest neighbor, the first one encountered winning ties.
    fn get_nearest(&mut self, point: &Point, dist: Dist) -> Option<NeighborDist<Id>>;
}

/// Implementation of nearest neighbors getters for an iterator over a set of points.
impl<Iter, Id, Point, RefPoint, Dist> GetNeighborhood<Id, Point, Dist> for Iter
where
    Iter: Iterator<Item = (Id, RefPoint)>,
    RefPoint: Deref<Target = Point>,
    Id: Ord,
    Dist: Fn(&Point, &Point) -> f64,
{
    fn get_neighborhood(&mut self, point: &Point, k: usize, dist: Dist) -> Vec<NeighborDist<Id>> {
        let mut ranking: Vec<_> = self
            .map(|(id, p)| {
                let dist = dist(point, &*p);
                NeighborDist(id, dist)
            })
            .collect();
        ranking.sort_by(rank);
        ranking.truncate(k);
        ranking
    }

    fn get_nearest(&mut self, point: &Point, dist: Dist) -> Option<NeighborDist<Id>> {
        self.map(|(id, p)| {
            let dist = dist(point, &*p);
            NeighborDist(id, dist)
        })
        .fold(None, closest)
    }
}

/// Orders neighbors by distance then by identifier.
fn rank<Id: Ord>(n1: &NeighborDist<Id>, n2: &NeighborDist<Id>) -> Ordering {
    n1.1.total_cmp(&n2.1).then_with(|| n1.0.cmp(&n2.0))
}

/// Keeps the current nearest unless the candidate is strictly closer.
fn closest<Id>(
    nearest: Option<NeighborDist<Id>>,
    candidate: NeighborDist<Id>,
) -> Option<NeighborDist<Id>> {
    match nearest {
        Some(n) if n.1 <= candidate.1 => Some(n),
        _ => Some(candidate),
    }
}
