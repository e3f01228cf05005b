use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use server_api::{ApiContext, ListQuery, LoginOutcome, Submission};
use shared::{
    domain::{Car, CarId, Driver, DriverId, Manufacturer, ManufacturerId},
    error::{ApiError, ErrorCode},
    protocol::{
        CarDetailContext, CarForm, DeleteContext, DriverCreateForm, DriverDetailContext,
        DriverLicenseForm, DriverListContext, FormContext, IndexContext, ListContext, LoginForm,
        ManufacturerForm,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod app_state;
mod config;
mod session;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use session::{clear_cookie, found, require_login, session_cookie, session_key, CurrentDriver};

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct NextQuery {
    next: Option<String>,
}

const MAX_FORM_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let purged = storage.purge_expired_sessions().await?;
    if purged > 0 {
        info!(purged, "removed expired sessions");
    }

    let api = ApiContext {
        storage,
        session_ttl: Duration::seconds(settings.session_ttl_seconds),
    };
    let state = AppState {
        api,
        cookie_secure: settings.cookie_secure,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/", get(index))
        .route("/manufacturers/", get(manufacturer_list))
        .route(
            "/manufacturers/create/",
            get(manufacturer_create_page).post(manufacturer_create),
        )
        .route(
            "/manufacturers/:id/update/",
            get(manufacturer_update_page).post(manufacturer_update),
        )
        .route(
            "/manufacturers/:id/delete/",
            get(manufacturer_delete_page).post(manufacturer_delete),
        )
        .route("/cars/", get(car_list))
        .route("/cars/create/", get(car_create_page).post(car_create))
        .route("/cars/:id/", get(car_detail))
        .route("/cars/:id/update/", get(car_update_page).post(car_update))
        .route("/cars/:id/delete/", get(car_delete_page).post(car_delete))
        .route("/cars/:id/toggle-assign/", post(car_toggle_assign))
        .route("/drivers/", get(driver_list))
        .route("/drivers/create/", get(driver_create_page).post(driver_create))
        .route("/drivers/:id/", get(driver_detail))
        .route(
            "/drivers/:id/update/",
            get(driver_update_page).post(driver_update),
        )
        .route(
            "/drivers/:id/delete/",
            get(driver_delete_page).post(driver_delete),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_login));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/accounts/login/", get(login_page).post(login_submit))
        .route("/accounts/logout/", post(logout))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(MAX_FORM_BYTES))
        .with_state(state)
}

pub(crate) fn http_error(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

/// A body that does not even parse as the form is a client error, not a redisplay.
fn form_body<F>(payload: Result<Json<F>, JsonRejection>) -> Result<F, HttpError> {
    payload.map(|Json(form)| form).map_err(|rejection| {
        http_error(ApiError::new(ErrorCode::Validation, rejection.body_text()))
    })
}

/// Valid forms redirect with `302`; invalid ones are redisplayed with `200`.
fn submission_response<F: Serialize>(submission: Submission<F>) -> Response {
    match submission {
        Submission::Redirect(location) => found(&location),
        Submission::Invalid(context) => (StatusCode::OK, Json(context)).into_response(),
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|error| {
        error!(%error, "health check failed");
        (StatusCode::SERVICE_UNAVAILABLE, Json(ApiError::internal()))
    })?;
    Ok("ok")
}

async fn login_page(Query(q): Query<NextQuery>) -> Json<FormContext<LoginForm>> {
    Json(server_api::login_form(q.next.as_deref()))
}

async fn login_submit(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    match server_api::login(&state.api, form).await.map_err(http_error)? {
        LoginOutcome::Authenticated { session, redirect } => {
            let cookie = session_cookie(
                &session.session_key,
                state.api.session_ttl.num_seconds(),
                state.cookie_secure,
            );
            let mut response = found(&redirect);
            let value = HeaderValue::from_str(&cookie).map_err(|error| {
                error!(%error, "session cookie is not a valid header value");
                http_error(ApiError::internal())
            })?;
            response.headers_mut().insert(header::SET_COOKIE, value);
            Ok(response)
        }
        LoginOutcome::Rejected(context) => Ok((StatusCode::OK, Json(context)).into_response()),
    }
}

async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let location = match session_key(&headers) {
        Some(key) => server_api::logout(&state.api, &key)
            .await
            .map_err(http_error)?,
        None => server_api::login_route().to_string(),
    };
    let mut response = found(&location);
    if let Ok(value) = HeaderValue::from_str(&clear_cookie(state.cookie_secure)) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

async fn index(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentDriver>,
) -> Result<Json<IndexContext>, HttpError> {
    let context = server_api::index(&state.api, &current.session_key)
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn manufacturer_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListContext<Manufacturer>>, HttpError> {
    let context = server_api::manufacturer_list(&state.api, &q)
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn manufacturer_create_page(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FormContext<ManufacturerForm>>, HttpError> {
    let context = server_api::manufacturer_form(&state.api, None)
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn manufacturer_create(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ManufacturerForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    let submission = server_api::manufacturer_create(&state.api, form)
        .await
        .map_err(http_error)?;
    Ok(submission_response(submission))
}

async fn manufacturer_update_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<FormContext<ManufacturerForm>>, HttpError> {
    let context = server_api::manufacturer_form(&state.api, Some(ManufacturerId(id)))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn manufacturer_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<ManufacturerForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    let submission = server_api::manufacturer_update(&state.api, ManufacturerId(id), form)
        .await
        .map_err(http_error)?;
    Ok(submission_response(submission))
}

async fn manufacturer_delete_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteContext<Manufacturer>>, HttpError> {
    let context = server_api::manufacturer_delete_confirm(&state.api, ManufacturerId(id))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn manufacturer_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, HttpError> {
    let location = server_api::manufacturer_delete(&state.api, ManufacturerId(id))
        .await
        .map_err(http_error)?;
    Ok(found(&location))
}

async fn car_list(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListContext<Car>>, HttpError> {
    let context = server_api::car_list(&state.api, &q)
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn car_detail(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentDriver>,
    Path(id): Path<i64>,
) -> Result<Json<CarDetailContext>, HttpError> {
    let context = server_api::car_detail(&state.api, current.driver_id, CarId(id))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn car_create_page(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FormContext<CarForm>>, HttpError> {
    let context = server_api::car_form(&state.api, None)
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn car_create(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CarForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    let submission = server_api::car_create(&state.api, form)
        .await
        .map_err(http_error)?;
    Ok(submission_response(submission))
}

async fn car_update_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<FormContext<CarForm>>, HttpError> {
    let context = server_api::car_form(&state.api, Some(CarId(id)))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn car_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<CarForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    let submission = server_api::car_update(&state.api, CarId(id), form)
        .await
        .map_err(http_error)?;
    Ok(submission_response(submission))
}

async fn car_delete_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteContext<Car>>, HttpError> {
    let context = server_api::car_delete_confirm(&state.api, CarId(id))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn car_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, HttpError> {
    let location = server_api::car_delete(&state.api, CarId(id))
        .await
        .map_err(http_error)?;
    Ok(found(&location))
}

async fn car_toggle_assign(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentDriver>,
    Path(id): Path<i64>,
) -> Result<Response, HttpError> {
    let location = server_api::car_toggle_assign(&state.api, current.driver_id, CarId(id))
        .await
        .map_err(http_error)?;
    Ok(found(&location))
}

async fn driver_list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentDriver>,
    Query(q): Query<ListQuery>,
) -> Result<Json<DriverListContext>, HttpError> {
    let context = server_api::driver_list(&state.api, current.driver_id, &q)
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn driver_detail(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentDriver>,
    Path(id): Path<i64>,
) -> Result<Json<DriverDetailContext>, HttpError> {
    let context = server_api::driver_detail(&state.api, current.driver_id, DriverId(id))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn driver_create_page() -> Json<FormContext<DriverCreateForm>> {
    Json(server_api::driver_create_form())
}

async fn driver_create(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<DriverCreateForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    let submission = server_api::driver_create(&state.api, form)
        .await
        .map_err(http_error)?;
    Ok(submission_response(submission))
}

async fn driver_update_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<FormContext<DriverLicenseForm>>, HttpError> {
    let context = server_api::driver_update_form(&state.api, DriverId(id))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn driver_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Result<Json<DriverLicenseForm>, JsonRejection>,
) -> Result<Response, HttpError> {
    let form = form_body(payload)?;
    let submission = server_api::driver_update(&state.api, DriverId(id), form)
        .await
        .map_err(http_error)?;
    Ok(submission_response(submission))
}

async fn driver_delete_page(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteContext<Driver>>, HttpError> {
    let context = server_api::driver_delete_confirm(&state.api, DriverId(id))
        .await
        .map_err(http_error)?;
    Ok(Json(context))
}

async fn driver_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, HttpError> {
    let location = server_api::driver_delete(&state.api, DriverId(id))
        .await
        .map_err(http_error)?;
    Ok(found(&location))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
