use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(ManufacturerId);
id_newtype!(CarId);
id_newtype!(DriverId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manufacturer {
    pub id: ManufacturerId,
    pub name: String,
    pub country: String,
}

/// A car with its manufacturer loaded in the same query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Car {
    pub id: CarId,
    pub model: String,
    pub manufacturer: Manufacturer,
}

/// Public view of a driver. The password hash never leaves storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub license_number: String,
}

impl Driver {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub drivers: i64,
    pub cars: i64,
    pub manufacturers: i64,
}
