//! Input cleaning for the entity forms.
//!
//! These checks only look at the submitted values. Rules that need the
//! database (uniqueness, foreign keys) run in the views after cleaning.

use shared::{
    domain::{DriverId, ManufacturerId},
    error::FieldError,
    protocol::{CarForm, DriverCreateForm, DriverLicenseForm, LoginForm, ManufacturerForm},
};

pub const NAME_MAX_CHARS: usize = 255;
pub const USERNAME_MAX_CHARS: usize = 150;
pub const PERSON_NAME_MAX_CHARS: usize = 150;
pub const PASSWORD_MIN_CHARS: usize = 8;
pub const LICENSE_NUMBER_CHARS: usize = 8;

const REQUIRED: &str = "This field is required.";
pub const INVALID_CHOICE: &str = "Select a valid choice. That choice is not one of the available choices.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanManufacturer {
    pub name: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanCar {
    pub model: String,
    pub manufacturer: ManufacturerId,
    pub drivers: Vec<DriverId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanDriver {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub license_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Default)]
struct Cleaner {
    errors: Vec<FieldError>,
}

impl Cleaner {
    fn required(&mut self, field: &str, value: Option<&str>, max_chars: usize) -> String {
        let value = value.map(str::trim).unwrap_or_default();
        if value.is_empty() {
            self.errors.push(FieldError::new(field, REQUIRED));
        } else {
            self.max_chars(field, value, max_chars);
        }
        value.to_string()
    }

    fn optional(&mut self, field: &str, value: Option<&str>, max_chars: usize) -> String {
        let value = value.map(str::trim).unwrap_or_default();
        self.max_chars(field, value, max_chars);
        value.to_string()
    }

    fn max_chars(&mut self, field: &str, value: &str, max_chars: usize) {
        let len = value.chars().count();
        if len > max_chars {
            self.errors.push(FieldError::new(
                field,
                format!("Ensure this value has at most {max_chars} characters (it has {len})."),
            ));
        }
    }

    fn finish<T>(self, value: T) -> Result<T, Vec<FieldError>> {
        if self.errors.is_empty() {
            Ok(value)
        } else {
            Err(self.errors)
        }
    }
}

pub fn clean_manufacturer(form: &ManufacturerForm) -> Result<CleanManufacturer, Vec<FieldError>> {
    let mut cleaner = Cleaner::default();
    let name = cleaner.required("name", form.name.as_deref(), NAME_MAX_CHARS);
    let country = cleaner.required("country", form.country.as_deref(), NAME_MAX_CHARS);
    cleaner.finish(CleanManufacturer { name, country })
}

pub fn clean_car(form: &CarForm) -> Result<CleanCar, Vec<FieldError>> {
    let mut cleaner = Cleaner::default();
    let model = cleaner.required("model", form.model.as_deref(), NAME_MAX_CHARS);
    let manufacturer = match form.manufacturer.as_ref().filter(|value| !value.is_blank()) {
        Some(value) => value.id().map(ManufacturerId).unwrap_or_else(|| {
            cleaner.errors.push(FieldError::new("manufacturer", INVALID_CHOICE));
            ManufacturerId(0)
        }),
        None => {
            cleaner.errors.push(FieldError::new("manufacturer", REQUIRED));
            ManufacturerId(0)
        }
    };

    let mut drivers = Vec::with_capacity(form.drivers.len());
    for value in &form.drivers {
        match value.id() {
            Some(id) => drivers.push(DriverId(id)),
            None => {
                cleaner.errors.push(FieldError::new(
                    "drivers",
                    format!("\u{201c}{value}\u{201d} is not a valid value."),
                ));
                break;
            }
        }
    }
    drivers.sort_unstable();
    drivers.dedup();

    cleaner.finish(CleanCar {
        model,
        manufacturer,
        drivers,
    })
}

pub fn clean_driver_create(form: &DriverCreateForm) -> Result<CleanDriver, Vec<FieldError>> {
    let mut cleaner = Cleaner::default();
    let username = cleaner.required("username", form.username.as_deref(), USERNAME_MAX_CHARS);
    if !username.is_empty() && !username.chars().all(is_username_char) {
        cleaner.errors.push(FieldError::new(
            "username",
            "Enter a valid username. This value may contain only letters, numbers, and @/./+/-/_ characters.",
        ));
    }

    let password = form.password.clone().unwrap_or_default();
    if password.is_empty() {
        cleaner.errors.push(FieldError::new("password", REQUIRED));
    } else if password.chars().count() < PASSWORD_MIN_CHARS {
        cleaner.errors.push(FieldError::new(
            "password",
            format!("This password is too short. It must contain at least {PASSWORD_MIN_CHARS} characters."),
        ));
    }

    let first_name = cleaner.optional("first_name", form.first_name.as_deref(), PERSON_NAME_MAX_CHARS);
    let last_name = cleaner.optional("last_name", form.last_name.as_deref(), PERSON_NAME_MAX_CHARS);
    let license_number = cleaner.required("license_number", form.license_number.as_deref(), usize::MAX);
    if !license_number.is_empty() {
        if let Err(message) = validate_license_number(&license_number) {
            cleaner.errors.push(FieldError::new("license_number", message));
        }
    }

    cleaner.finish(CleanDriver {
        username,
        password,
        first_name,
        last_name,
        license_number,
    })
}

pub fn clean_driver_license(form: &DriverLicenseForm) -> Result<String, Vec<FieldError>> {
    let mut cleaner = Cleaner::default();
    let license_number = cleaner.required("license_number", form.license_number.as_deref(), usize::MAX);
    if !license_number.is_empty() {
        if let Err(message) = validate_license_number(&license_number) {
            cleaner.errors.push(FieldError::new("license_number", message));
        }
    }
    cleaner.finish(license_number)
}

pub fn clean_login(form: &LoginForm) -> Result<Credentials, Vec<FieldError>> {
    let mut cleaner = Cleaner::default();
    let username = cleaner.required("username", form.username.as_deref(), USERNAME_MAX_CHARS);
    let password = form.password.clone().unwrap_or_default();
    if password.is_empty() {
        cleaner.errors.push(FieldError::new("password", REQUIRED));
    }
    cleaner.finish(Credentials { username, password })
}

/// A license number is three uppercase ASCII letters followed by five digits, e.g. `ABC12345`.
pub fn validate_license_number(value: &str) -> Result<(), String> {
    if value.chars().count() != LICENSE_NUMBER_CHARS {
        return Err(format!(
            "License number should consist of {LICENSE_NUMBER_CHARS} characters."
        ));
    }
    let chars: Vec<char> = value.chars().collect();
    if !chars[..3].iter().all(char::is_ascii_uppercase) {
        return Err("First 3 characters should be uppercase letters.".to_string());
    }
    if !chars[3..].iter().all(char::is_ascii_digit) {
        return Err("Last 5 characters should be digits.".to_string());
    }
    Ok(())
}

fn is_username_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '@' | '.' | '+' | '-' | '_')
}

#[cfg(test)]
#[path = "tests/forms_tests.rs"]
mod tests;
