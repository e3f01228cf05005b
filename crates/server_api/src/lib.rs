//! View layer of the fleet service.
//!
//! Each view takes an [`ApiContext`] and returns the render context a template
//! would consume, or a [`Submission`] telling the HTTP layer where to redirect
//! after a successful write. Join plans, per view:
//!
//! - manufacturer list: count + one page query, ordered by name;
//! - car list: count + one page query joining `manufacturers`;
//! - driver list: count + one page query;
//! - car detail: car joined to manufacturer + one query for its drivers;
//! - driver detail: driver + one query for cars joined to manufacturers.

use chrono::Duration;
use shared::{
    domain::{Car, CarId, Driver, DriverId, Manufacturer, ManufacturerId},
    error::{ApiError, FieldError},
    protocol::{
        CarChoices, CarDetailContext, CarForm, DeleteContext, DriverCreateForm,
        DriverDetailContext, DriverLicenseForm, DriverListContext, FormContext, IndexContext,
        ListContext, LoginForm, ManufacturerForm,
    },
};
use storage::{NewDriver, Storage, StoredSession};
use tracing::{error, info, warn};

pub mod auth;
pub mod forms;
pub mod pagination;

pub use pagination::{ListQuery, Paginator, PAGE_SIZE};

use forms::{CleanCar, CleanManufacturer};

/// Session counter bumped by every dashboard visit.
pub const VISITS_COUNTER: &str = "num_visits";

pub const DEFAULT_SESSION_TTL_SECONDS: i64 = 14 * 24 * 60 * 60;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub session_ttl: Duration,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECONDS),
        }
    }
}

/// Result of a form POST: either the write happened and the client should be
/// sent elsewhere, or nothing was written and the form comes back with errors.
#[derive(Debug)]
pub enum Submission<F> {
    Redirect(String),
    Invalid(FormContext<F>),
}

impl<F> Submission<F> {
    pub fn redirect_target(&self) -> Option<&str> {
        match self {
            Submission::Redirect(location) => Some(location),
            Submission::Invalid(_) => None,
        }
    }
}

#[derive(Debug)]
pub enum LoginOutcome {
    Authenticated {
        session: StoredSession,
        redirect: String,
    },
    Rejected(FormContext<LoginForm>),
}

pub fn index_route() -> &'static str {
    "/"
}

pub fn login_route() -> &'static str {
    "/accounts/login/"
}

pub fn manufacturer_list_route() -> &'static str {
    "/manufacturers/"
}

pub fn car_list_route() -> &'static str {
    "/cars/"
}

pub fn car_detail_route(car_id: CarId) -> String {
    format!("/cars/{}/", car_id.0)
}

pub fn driver_list_route() -> &'static str {
    "/drivers/"
}

pub async fn index(ctx: &ApiContext, session_key: &str) -> Result<IndexContext, ApiError> {
    let num_visits = ctx
        .storage
        .increment_session_counter(session_key, VISITS_COUNTER)
        .await
        .map_err(internal)?;
    let counts = ctx.storage.entity_counts().await.map_err(internal)?;
    Ok(IndexContext {
        num_drivers: counts.drivers,
        num_cars: counts.cars,
        num_manufacturers: counts.manufacturers,
        num_visits,
    })
}

// Manufacturers

pub async fn manufacturer_list(
    ctx: &ApiContext,
    query: &ListQuery,
) -> Result<ListContext<Manufacturer>, ApiError> {
    let search = query.search();
    let count = ctx
        .storage
        .count_manufacturers(search)
        .await
        .map_err(internal)?;
    let paginator = Paginator::new(count, PAGE_SIZE);
    let number = paginator.resolve(query.page.as_deref())?;
    let object_list = ctx
        .storage
        .list_manufacturers(search, paginator.limit(), paginator.offset(number))
        .await
        .map_err(internal)?;
    Ok(ListContext {
        object_list,
        page_obj: paginator.page_info(number),
        search: search.map(str::to_string),
    })
}

pub async fn manufacturer_form(
    ctx: &ApiContext,
    manufacturer_id: Option<ManufacturerId>,
) -> Result<FormContext<ManufacturerForm>, ApiError> {
    let Some(id) = manufacturer_id else {
        return Ok(FormContext::new(None, ManufacturerForm::default()));
    };
    let manufacturer = load_manufacturer(ctx, id).await?;
    Ok(FormContext::new(
        Some(id.0),
        ManufacturerForm {
            name: Some(manufacturer.name),
            country: Some(manufacturer.country),
        },
    ))
}

pub async fn manufacturer_create(
    ctx: &ApiContext,
    form: ManufacturerForm,
) -> Result<Submission<ManufacturerForm>, ApiError> {
    let clean = match validate_manufacturer(ctx, &form, None).await? {
        Ok(clean) => clean,
        Err(errors) => return Ok(Submission::Invalid(FormContext::new(None, form).with_errors(errors))),
    };
    let id = ctx
        .storage
        .create_manufacturer(&clean.name, &clean.country)
        .await
        .map_err(internal)?;
    info!(manufacturer_id = id.0, name = %clean.name, "manufacturer created");
    Ok(Submission::Redirect(manufacturer_list_route().to_string()))
}

pub async fn manufacturer_update(
    ctx: &ApiContext,
    id: ManufacturerId,
    form: ManufacturerForm,
) -> Result<Submission<ManufacturerForm>, ApiError> {
    load_manufacturer(ctx, id).await?;
    let clean = match validate_manufacturer(ctx, &form, Some(id)).await? {
        Ok(clean) => clean,
        Err(errors) => {
            return Ok(Submission::Invalid(
                FormContext::new(Some(id.0), form).with_errors(errors),
            ))
        }
    };
    let updated = ctx
        .storage
        .update_manufacturer(id, &clean.name, &clean.country)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(manufacturer_not_found());
    }
    info!(manufacturer_id = id.0, "manufacturer updated");
    Ok(Submission::Redirect(manufacturer_list_route().to_string()))
}

pub async fn manufacturer_delete_confirm(
    ctx: &ApiContext,
    id: ManufacturerId,
) -> Result<DeleteContext<Manufacturer>, ApiError> {
    let object = load_manufacturer(ctx, id).await?;
    Ok(DeleteContext { object })
}

pub async fn manufacturer_delete(ctx: &ApiContext, id: ManufacturerId) -> Result<String, ApiError> {
    let deleted = ctx
        .storage
        .delete_manufacturer(id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(manufacturer_not_found());
    }
    info!(manufacturer_id = id.0, "manufacturer deleted");
    Ok(manufacturer_list_route().to_string())
}

async fn load_manufacturer(ctx: &ApiContext, id: ManufacturerId) -> Result<Manufacturer, ApiError> {
    ctx.storage
        .get_manufacturer(id)
        .await
        .map_err(internal)?
        .ok_or_else(manufacturer_not_found)
}

async fn validate_manufacturer(
    ctx: &ApiContext,
    form: &ManufacturerForm,
    exclude: Option<ManufacturerId>,
) -> Result<Result<CleanManufacturer, Vec<FieldError>>, ApiError> {
    let clean = match forms::clean_manufacturer(form) {
        Ok(clean) => clean,
        Err(errors) => return Ok(Err(errors)),
    };
    let taken = ctx
        .storage
        .manufacturer_name_taken(&clean.name, exclude)
        .await
        .map_err(internal)?;
    if taken {
        return Ok(Err(vec![FieldError::new(
            "name",
            "Manufacturer with this Name already exists.",
        )]));
    }
    Ok(Ok(clean))
}

fn manufacturer_not_found() -> ApiError {
    ApiError::not_found("No manufacturer found matching the query")
}

// Cars

pub async fn car_list(ctx: &ApiContext, query: &ListQuery) -> Result<ListContext<Car>, ApiError> {
    let search = query.search();
    let count = ctx.storage.count_cars(search).await.map_err(internal)?;
    let paginator = Paginator::new(count, PAGE_SIZE);
    let number = paginator.resolve(query.page.as_deref())?;
    let object_list = ctx
        .storage
        .list_cars(search, paginator.limit(), paginator.offset(number))
        .await
        .map_err(internal)?;
    Ok(ListContext {
        object_list,
        page_obj: paginator.page_info(number),
        search: search.map(str::to_string),
    })
}

pub async fn car_detail(
    ctx: &ApiContext,
    viewer: DriverId,
    id: CarId,
) -> Result<CarDetailContext, ApiError> {
    let car = load_car(ctx, id).await?;
    let drivers = ctx.storage.drivers_for_car(id).await.map_err(internal)?;
    let current_user_assigned = drivers.iter().any(|driver| driver.id == viewer);
    Ok(CarDetailContext {
        car,
        drivers,
        current_user_assigned,
    })
}

pub async fn car_form(ctx: &ApiContext, car_id: Option<CarId>) -> Result<FormContext<CarForm>, ApiError> {
    let context = match car_id {
        None => FormContext::new(None, CarForm::default()),
        Some(id) => {
            let car = load_car(ctx, id).await?;
            let drivers = ctx.storage.car_driver_ids(id).await.map_err(internal)?;
            FormContext::new(
                Some(id.0),
                CarForm {
                    model: Some(car.model),
                    manufacturer: Some(car.manufacturer.id.0.into()),
                    drivers: drivers.into_iter().map(|driver| driver.0.into()).collect(),
                },
            )
        }
    };
    Ok(context.with_choices(car_choices(ctx).await?))
}

pub async fn car_create(ctx: &ApiContext, form: CarForm) -> Result<Submission<CarForm>, ApiError> {
    let clean = match validate_car(ctx, &form).await? {
        Ok(clean) => clean,
        Err(errors) => {
            let context = FormContext::new(None, form)
                .with_errors(errors)
                .with_choices(car_choices(ctx).await?);
            return Ok(Submission::Invalid(context));
        }
    };
    let id = ctx
        .storage
        .create_car(&clean.model, clean.manufacturer, &clean.drivers)
        .await
        .map_err(internal)?;
    info!(car_id = id.0, model = %clean.model, "car created");
    Ok(Submission::Redirect(car_list_route().to_string()))
}

pub async fn car_update(
    ctx: &ApiContext,
    id: CarId,
    form: CarForm,
) -> Result<Submission<CarForm>, ApiError> {
    load_car(ctx, id).await?;
    let clean = match validate_car(ctx, &form).await? {
        Ok(clean) => clean,
        Err(errors) => {
            let context = FormContext::new(Some(id.0), form)
                .with_errors(errors)
                .with_choices(car_choices(ctx).await?);
            return Ok(Submission::Invalid(context));
        }
    };
    let updated = ctx
        .storage
        .update_car(id, &clean.model, clean.manufacturer, &clean.drivers)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(car_not_found());
    }
    info!(car_id = id.0, "car updated");
    Ok(Submission::Redirect(car_detail_route(id)))
}

pub async fn car_delete_confirm(ctx: &ApiContext, id: CarId) -> Result<DeleteContext<Car>, ApiError> {
    let object = load_car(ctx, id).await?;
    Ok(DeleteContext { object })
}

pub async fn car_delete(ctx: &ApiContext, id: CarId) -> Result<String, ApiError> {
    let deleted = ctx.storage.delete_car(id).await.map_err(internal)?;
    if !deleted {
        return Err(car_not_found());
    }
    info!(car_id = id.0, "car deleted");
    Ok(car_list_route().to_string())
}

/// Assigns the requesting driver to the car, or removes them if already assigned.
pub async fn car_toggle_assign(
    ctx: &ApiContext,
    viewer: DriverId,
    id: CarId,
) -> Result<String, ApiError> {
    load_car(ctx, id).await?;
    let assigned = ctx
        .storage
        .toggle_car_driver(id, viewer)
        .await
        .map_err(internal)?;
    info!(car_id = id.0, driver_id = viewer.0, assigned, "car assignment toggled");
    Ok(car_detail_route(id))
}

async fn load_car(ctx: &ApiContext, id: CarId) -> Result<Car, ApiError> {
    ctx.storage
        .get_car(id)
        .await
        .map_err(internal)?
        .ok_or_else(car_not_found)
}

async fn car_choices(ctx: &ApiContext) -> Result<CarChoices, ApiError> {
    Ok(CarChoices {
        manufacturers: ctx.storage.all_manufacturers().await.map_err(internal)?,
        drivers: ctx.storage.all_drivers().await.map_err(internal)?,
    })
}

async fn validate_car(
    ctx: &ApiContext,
    form: &CarForm,
) -> Result<Result<CleanCar, Vec<FieldError>>, ApiError> {
    let clean = match forms::clean_car(form) {
        Ok(clean) => clean,
        Err(errors) => return Ok(Err(errors)),
    };

    let mut errors = Vec::new();
    let manufacturer = ctx
        .storage
        .get_manufacturer(clean.manufacturer)
        .await
        .map_err(internal)?;
    if manufacturer.is_none() {
        errors.push(FieldError::new("manufacturer", forms::INVALID_CHOICE));
    }

    let existing = ctx
        .storage
        .existing_driver_ids(&clean.drivers)
        .await
        .map_err(internal)?;
    if let Some(missing) = clean.drivers.iter().find(|id| !existing.contains(id)) {
        errors.push(FieldError::new(
            "drivers",
            format!(
                "Select a valid choice. {} is not one of the available choices.",
                missing.0
            ),
        ));
    }

    if errors.is_empty() {
        Ok(Ok(clean))
    } else {
        Ok(Err(errors))
    }
}

fn car_not_found() -> ApiError {
    ApiError::not_found("No car found matching the query")
}

// Drivers

pub async fn driver_list(
    ctx: &ApiContext,
    viewer: DriverId,
    query: &ListQuery,
) -> Result<DriverListContext, ApiError> {
    let search = query.search();
    let count = ctx.storage.count_drivers(search).await.map_err(internal)?;
    let paginator = Paginator::new(count, PAGE_SIZE);
    let number = paginator.resolve(query.page.as_deref())?;
    let object_list = ctx
        .storage
        .list_drivers(search, paginator.limit(), paginator.offset(number))
        .await
        .map_err(internal)?;
    Ok(DriverListContext {
        list: ListContext {
            object_list,
            page_obj: paginator.page_info(number),
            search: search.map(str::to_string),
        },
        current_user_id: viewer,
    })
}

pub async fn driver_detail(
    ctx: &ApiContext,
    viewer: DriverId,
    id: DriverId,
) -> Result<DriverDetailContext, ApiError> {
    let driver = load_driver(ctx, id).await?;
    let cars = ctx.storage.cars_for_driver(id).await.map_err(internal)?;
    Ok(DriverDetailContext {
        driver,
        cars,
        is_current_user: viewer == id,
    })
}

pub fn driver_create_form() -> FormContext<DriverCreateForm> {
    FormContext::new(None, DriverCreateForm::default())
}

pub async fn driver_create(
    ctx: &ApiContext,
    form: DriverCreateForm,
) -> Result<Submission<DriverCreateForm>, ApiError> {
    let clean = match forms::clean_driver_create(&form) {
        Ok(clean) => clean,
        Err(errors) => return Ok(Submission::Invalid(FormContext::new(None, form).with_errors(errors))),
    };

    let mut errors = Vec::new();
    if ctx
        .storage
        .username_taken(&clean.username)
        .await
        .map_err(internal)?
    {
        errors.push(FieldError::new(
            "username",
            "A user with that username already exists.",
        ));
    }
    if ctx
        .storage
        .license_taken(&clean.license_number, None)
        .await
        .map_err(internal)?
    {
        errors.push(license_taken_error());
    }
    if !errors.is_empty() {
        return Ok(Submission::Invalid(FormContext::new(None, form).with_errors(errors)));
    }

    let password_hash = auth::hash_password(&clean.password).map_err(internal)?;
    let id = ctx
        .storage
        .create_driver(&NewDriver {
            username: &clean.username,
            first_name: &clean.first_name,
            last_name: &clean.last_name,
            license_number: &clean.license_number,
            password_hash: &password_hash,
        })
        .await
        .map_err(internal)?;
    info!(driver_id = id.0, username = %clean.username, "driver created");
    Ok(Submission::Redirect(driver_list_route().to_string()))
}

pub async fn driver_update_form(
    ctx: &ApiContext,
    id: DriverId,
) -> Result<FormContext<DriverLicenseForm>, ApiError> {
    let driver = load_driver(ctx, id).await?;
    Ok(FormContext::new(
        Some(id.0),
        DriverLicenseForm {
            license_number: Some(driver.license_number),
        },
    ))
}

pub async fn driver_update(
    ctx: &ApiContext,
    id: DriverId,
    form: DriverLicenseForm,
) -> Result<Submission<DriverLicenseForm>, ApiError> {
    load_driver(ctx, id).await?;
    let license_number = match forms::clean_driver_license(&form) {
        Ok(license_number) => license_number,
        Err(errors) => {
            return Ok(Submission::Invalid(
                FormContext::new(Some(id.0), form).with_errors(errors),
            ))
        }
    };
    if ctx
        .storage
        .license_taken(&license_number, Some(id))
        .await
        .map_err(internal)?
    {
        return Ok(Submission::Invalid(
            FormContext::new(Some(id.0), form).with_errors(vec![license_taken_error()]),
        ));
    }
    let updated = ctx
        .storage
        .update_driver_license(id, &license_number)
        .await
        .map_err(internal)?;
    if !updated {
        return Err(driver_not_found());
    }
    info!(driver_id = id.0, "driver license updated");
    Ok(Submission::Redirect(driver_list_route().to_string()))
}

pub async fn driver_delete_confirm(
    ctx: &ApiContext,
    id: DriverId,
) -> Result<DeleteContext<Driver>, ApiError> {
    let object = load_driver(ctx, id).await?;
    Ok(DeleteContext { object })
}

pub async fn driver_delete(ctx: &ApiContext, id: DriverId) -> Result<String, ApiError> {
    let deleted = ctx.storage.delete_driver(id).await.map_err(internal)?;
    if !deleted {
        return Err(driver_not_found());
    }
    info!(driver_id = id.0, "driver deleted");
    Ok(driver_list_route().to_string())
}

async fn load_driver(ctx: &ApiContext, id: DriverId) -> Result<Driver, ApiError> {
    ctx.storage
        .get_driver(id)
        .await
        .map_err(internal)?
        .ok_or_else(driver_not_found)
}

fn license_taken_error() -> FieldError {
    FieldError::new(
        "license_number",
        "Driver with this License number already exists.",
    )
}

fn driver_not_found() -> ApiError {
    ApiError::not_found("No driver found matching the query")
}

// Sessions

pub fn login_form(next: Option<&str>) -> FormContext<LoginForm> {
    FormContext::new(
        None,
        LoginForm {
            username: None,
            password: None,
            next: auth::safe_next(next),
        },
    )
}

pub async fn login(ctx: &ApiContext, form: LoginForm) -> Result<LoginOutcome, ApiError> {
    let credentials = match forms::clean_login(&form) {
        Ok(credentials) => credentials,
        Err(errors) => return Ok(LoginOutcome::Rejected(FormContext::new(None, form).with_errors(errors))),
    };

    let stored = ctx
        .storage
        .credentials_for_username(&credentials.username)
        .await
        .map_err(internal)?;
    let driver_id = match stored {
        Some(stored) if auth::verify_password(&credentials.password, &stored.password_hash) => {
            stored.driver_id
        }
        _ => {
            warn!(username = %credentials.username, "login rejected");
            let error = FieldError::non_field(
                "Please enter a correct username and password. Note that both fields may be case-sensitive.",
            );
            return Ok(LoginOutcome::Rejected(
                FormContext::new(None, form).with_errors(vec![error]),
            ));
        }
    };

    let session = ctx
        .storage
        .create_session(driver_id, ctx.session_ttl)
        .await
        .map_err(internal)?;
    info!(driver_id = driver_id.0, "driver logged in");
    let redirect = auth::safe_next(form.next.as_deref()).unwrap_or_else(|| index_route().to_string());
    Ok(LoginOutcome::Authenticated { session, redirect })
}

pub async fn logout(ctx: &ApiContext, session_key: &str) -> Result<String, ApiError> {
    ctx.storage
        .delete_session(session_key)
        .await
        .map_err(internal)?;
    Ok(login_route().to_string())
}

/// Resolves a session cookie value to a live session.
pub async fn current_session(
    ctx: &ApiContext,
    session_key: &str,
) -> Result<Option<StoredSession>, ApiError> {
    ctx.storage
        .load_session(session_key)
        .await
        .map_err(internal)
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %err, "store operation failed");
    ApiError::internal()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
