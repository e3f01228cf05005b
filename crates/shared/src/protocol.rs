use serde::{Deserialize, Serialize};

use crate::{
    domain::{Car, Driver, DriverId, Manufacturer},
    error::FieldError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexContext {
    pub num_drivers: i64,
    pub num_cars: i64,
    pub num_manufacturers: i64,
    pub num_visits: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub number: u32,
    pub num_pages: u32,
    pub count: i64,
    pub per_page: u32,
    pub has_next: bool,
    pub has_previous: bool,
    pub is_paginated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListContext<T> {
    pub object_list: Vec<T>,
    pub page_obj: PageInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverListContext {
    #[serde(flatten)]
    pub list: ListContext<Driver>,
    pub current_user_id: DriverId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarDetailContext {
    pub car: Car,
    pub drivers: Vec<Driver>,
    pub current_user_assigned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverDetailContext {
    pub driver: Driver,
    pub cars: Vec<Car>,
    pub is_current_user: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteContext<T> {
    pub object: T,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerForm {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// A submitted value for a relation field, kept as sent so a malformed id can
/// be reported against its field instead of rejecting the whole body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChoiceValue {
    Id(i64),
    Text(String),
}

impl ChoiceValue {
    /// The primary key this value names, if it names one at all.
    pub fn id(&self) -> Option<i64> {
        match self {
            ChoiceValue::Id(id) => Some(*id),
            ChoiceValue::Text(text) => text.trim().parse().ok(),
        }
        .filter(|id| *id > 0)
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, ChoiceValue::Text(text) if text.trim().is_empty())
    }
}

impl std::fmt::Display for ChoiceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChoiceValue::Id(id) => write!(f, "{id}"),
            ChoiceValue::Text(text) => f.write_str(text),
        }
    }
}

impl From<i64> for ChoiceValue {
    fn from(id: i64) -> Self {
        ChoiceValue::Id(id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarForm {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<ChoiceValue>,
    #[serde(default)]
    pub drivers: Vec<ChoiceValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCreateForm {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub license_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverLicenseForm {
    #[serde(default)]
    pub license_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Choice lists a car form offers for its relation fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CarChoices {
    pub manufacturers: Vec<Manufacturer>,
    pub drivers: Vec<Driver>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormContext<F> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<i64>,
    pub form: F,
    pub errors: Vec<FieldError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<CarChoices>,
}

impl<F> FormContext<F> {
    pub fn new(object_id: Option<i64>, form: F) -> Self {
        Self {
            object_id,
            form,
            errors: Vec::new(),
            choices: None,
        }
    }

    pub fn with_errors(mut self, errors: Vec<FieldError>) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_choices(mut self, choices: CarChoices) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
