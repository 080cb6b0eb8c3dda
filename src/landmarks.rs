// src/landmarks.rs - The 19 cephalometric landmarks and landmark sets

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const LANDMARK_COUNT: usize = 19;

/// A 2D point with floating-point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        [self.x, self.y].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let [x, y] = <[f64; 2]>::deserialize(deserializer)?;
        Ok(Point::new(x, y))
    }
}

/// Anatomically defined points on a lateral cephalogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Landmark {
    /// Nasion
    N,
    /// Sella
    S,
    /// Articulare
    Ar,
    /// Orbitale
    Or,
    /// Porion
    Po,
    /// A point (subspinale)
    A,
    /// B point (supramentale)
    B,
    /// Upper incisor tip
    U1,
    /// Labrale superius
    Ls,
    /// Soft tissue pogonion
    SoftPog,
    /// Gonion
    Go,
    /// Pogonion
    Pog,
    /// Menton
    Me,
    /// Anterior nasal spine
    Ans,
    /// Posterior nasal spine
    Pns,
    /// Gnathion
    Gn,
    /// Lower incisor tip
    L1,
    /// Labrale inferius
    Li,
    /// Pronasale
    Pn,
}

impl Landmark {
    /// All landmarks in canonical order.
    pub const ALL: [Landmark; LANDMARK_COUNT] = [
        Landmark::N,
        Landmark::S,
        Landmark::Ar,
        Landmark::Or,
        Landmark::Po,
        Landmark::A,
        Landmark::B,
        Landmark::U1,
        Landmark::Ls,
        Landmark::SoftPog,
        Landmark::Go,
        Landmark::Pog,
        Landmark::Me,
        Landmark::Ans,
        Landmark::Pns,
        Landmark::Gn,
        Landmark::L1,
        Landmark::Li,
        Landmark::Pn,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    /// The conventional abbreviation used in reference data files.
    pub const fn name(self) -> &'static str {
        match self {
            Landmark::N => "N",
            Landmark::S => "S",
            Landmark::Ar => "Ar",
            Landmark::Or => "Or",
            Landmark::Po => "Po",
            Landmark::A => "A",
            Landmark::B => "B",
            Landmark::U1 => "U1",
            Landmark::Ls => "Ls",
            Landmark::SoftPog => "Pog'",
            Landmark::Go => "Go",
            Landmark::Pog => "Pog",
            Landmark::Me => "Me",
            Landmark::Ans => "ANS",
            Landmark::Pns => "PNS",
            Landmark::Gn => "Gn",
            Landmark::L1 => "L1",
            Landmark::Li => "Li",
            Landmark::Pn => "Pn",
        }
    }
}

impl fmt::Display for Landmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLandmark(pub String);

impl fmt::Display for UnknownLandmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown landmark name '{}'", self.0)
    }
}

impl std::error::Error for UnknownLandmark {}

impl FromStr for Landmark {
    type Err = UnknownLandmark;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Landmark::ALL
            .iter()
            .copied()
            .find(|l| l.name() == s)
            .ok_or_else(|| UnknownLandmark(s.to_string()))
    }
}

/// Mapping from landmark to coordinate, indexed by [`Landmark`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LandmarkSet {
    points: [Option<Point>; LANDMARK_COUNT],
}

impl LandmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, landmark: Landmark) -> Option<Point> {
        self.points[landmark.index()]
    }

    pub fn set(&mut self, landmark: Landmark, point: Point) {
        self.points[landmark.index()] = Some(point);
    }

    pub fn remove(&mut self, landmark: Landmark) -> Option<Point> {
        self.points[landmark.index()].take()
    }

    pub fn with(mut self, landmark: Landmark, point: Point) -> Self {
        self.set(landmark, point);
        self
    }

    pub fn contains(&self, landmark: Landmark) -> bool {
        self.points[landmark.index()].is_some()
    }

    /// Number of landmarks present.
    pub fn len(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_complete(&self) -> bool {
        self.len() == LANDMARK_COUNT
    }

    pub fn missing(&self) -> Vec<Landmark> {
        Landmark::ALL
            .iter()
            .copied()
            .filter(|l| !self.contains(*l))
            .collect()
    }

    /// Present landmarks in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Landmark, Point)> + '_ {
        Landmark::ALL
            .iter()
            .filter_map(move |&l| self.get(l).map(|p| (l, p)))
    }

    /// Apply `f` to every present point, returning a new set.
    pub fn map_points<F>(&self, mut f: F) -> LandmarkSet
    where
        F: FnMut(Landmark, Point) -> Point,
    {
        let mut out = LandmarkSet::new();
        for (landmark, point) in self.iter() {
            out.set(landmark, f(landmark, point));
        }
        out
    }

    /// Scale normalized (0..1) coordinates to pixel coordinates.
    pub fn scaled(&self, width: f64, height: f64) -> LandmarkSet {
        self.map_points(|_, p| Point::new(p.x * width, p.y * height))
    }
}

impl FromIterator<(Landmark, Point)> for LandmarkSet {
    fn from_iter<I: IntoIterator<Item = (Landmark, Point)>>(iter: I) -> Self {
        let mut set = LandmarkSet::new();
        for (landmark, point) in iter {
            set.set(landmark, point);
        }
        set
    }
}

impl Serialize for LandmarkSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (landmark, point) in self.iter() {
            map.serialize_entry(landmark.name(), &point)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LandmarkSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = BTreeMap::<String, Point>::deserialize(deserializer)?;
        let mut set = LandmarkSet::new();
        for (name, point) in raw {
            let landmark = name.parse::<Landmark>().map_err(D::Error::custom)?;
            set.set(landmark, point);
        }
        Ok(set)
    }
}
