use super::*;
use axum::{body, body::Body, http::Request};
use server_api::auth::hash_password;
use storage::NewDriver;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    storage: Storage,
    driver: DriverId,
    cookie: String,
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let driver = storage
        .create_driver(&NewDriver {
            username: "alice",
            first_name: "Alice",
            last_name: "Liddell",
            license_number: "ALI12345",
            password_hash: &hash_password("wonderland").expect("hash"),
        })
        .await
        .expect("driver");
    let session = storage
        .create_session(driver, Duration::hours(1))
        .await
        .expect("session");

    let router = build_router(Arc::new(AppState {
        api: ApiContext::new(storage.clone()),
        cookie_secure: false,
    }));
    TestApp {
        router,
        storage,
        driver,
        cookie: format!("{}={}", session::SESSION_COOKIE, session.session_key),
    }
}

impl TestApp {
    async fn get(&self, uri: &str) -> Response {
        let request = Request::get(uri)
            .header(header::COOKIE, &self.cookie)
            .body(Body::empty())
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }

    async fn post(&self, uri: &str, payload: serde_json::Value) -> Response {
        let request = Request::post(uri)
            .header(header::COOKIE, &self.cookie)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request");
        self.router.clone().oneshot(request).await.expect("response")
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

fn location(response: &Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .expect("location header")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let app = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn protected_routes_redirect_anonymous_clients_to_login() {
    let app = test_app().await;
    let routes = [
        ("GET", "/"),
        ("GET", "/manufacturers/"),
        ("GET", "/manufacturers/create/"),
        ("POST", "/manufacturers/create/"),
        ("GET", "/manufacturers/1/update/"),
        ("POST", "/manufacturers/1/update/"),
        ("GET", "/manufacturers/1/delete/"),
        ("POST", "/manufacturers/1/delete/"),
        ("GET", "/cars/"),
        ("GET", "/cars/1/"),
        ("GET", "/cars/create/"),
        ("POST", "/cars/create/"),
        ("GET", "/cars/1/update/"),
        ("POST", "/cars/1/update/"),
        ("GET", "/cars/1/delete/"),
        ("POST", "/cars/1/delete/"),
        ("POST", "/cars/1/toggle-assign/"),
        ("GET", "/drivers/"),
        ("GET", "/drivers/1/"),
        ("GET", "/drivers/create/"),
        ("POST", "/drivers/create/"),
        ("GET", "/drivers/1/update/"),
        ("POST", "/drivers/1/update/"),
        ("GET", "/drivers/1/delete/"),
        ("POST", "/drivers/1/delete/"),
    ];

    let before = app.storage.round_trips();
    for (method, uri) in routes {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::FOUND, "{method} {uri}");
        let encoded: String = url::form_urlencoded::byte_serialize(uri.as_bytes()).collect();
        assert_eq!(
            location(&response),
            format!("/accounts/login/?next={encoded}"),
            "{method} {uri}"
        );
    }
    assert_eq!(app.storage.round_trips(), before, "guard must not touch the store");
}

#[tokio::test]
async fn unknown_session_cookie_is_cleared_and_redirected() {
    let app = test_app().await;
    let request = Request::get("/cars/?page=2")
        .header(header::COOKIE, "sessionid=not-a-session")
        .body(Body::empty())
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/accounts/login/?next=%2Fcars%2F%3Fpage%3D2");
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("set-cookie");
    assert!(cookie.starts_with("sessionid=;"));
    assert!(cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn dashboard_counts_visits_within_a_session() {
    let app = test_app().await;
    app.storage
        .create_manufacturer("Toyota", "Japan")
        .await
        .expect("manufacturer");

    let mut last = None;
    for _ in 0..3 {
        let response = app.get("/").await;
        assert_eq!(response.status(), StatusCode::OK);
        last = Some(json_body::<IndexContext>(response).await);
    }
    let context = last.expect("context");
    assert_eq!(context.num_visits, 3);
    assert_eq!(context.num_drivers, 1);
    assert_eq!(context.num_cars, 0);
    assert_eq!(context.num_manufacturers, 1);
}

#[tokio::test]
async fn manufacturer_list_is_sorted_and_paginated() {
    let app = test_app().await;
    for name in ["Volvo", "Audi", "Tesla", "BMW", "Kia", "Fiat", "Mazda"] {
        app.storage
            .create_manufacturer(name, "Somewhere")
            .await
            .expect("manufacturer");
    }

    let response = app.get("/manufacturers/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let first: ListContext<Manufacturer> = json_body(response).await;
    let names: Vec<_> = first.object_list.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["Audi", "BMW", "Fiat", "Kia", "Mazda"]);
    assert_eq!(first.page_obj.num_pages, 2);
    assert!(first.page_obj.has_next);

    let last: ListContext<Manufacturer> = json_body(app.get("/manufacturers/?page=last").await).await;
    let names: Vec<_> = last.object_list.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, ["Tesla", "Volvo"]);

    let response = app.get("/manufacturers/?page=9").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn car_list_page_uses_a_fixed_number_of_queries() {
    let app = test_app().await;
    let toyota = app
        .storage
        .create_manufacturer("Toyota", "Japan")
        .await
        .expect("manufacturer");
    for model in ["Corolla", "Camry", "Prius", "Yaris", "Supra", "Crown"] {
        app.storage
            .create_car(model, toyota, &[app.driver])
            .await
            .expect("car");
    }

    let before = app.storage.round_trips();
    let response = app.get("/cars/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let spent = app.storage.round_trips() - before;
    let context: ListContext<Car> = json_body(response).await;
    assert_eq!(context.object_list.len(), 5);
    assert!(context
        .object_list
        .iter()
        .all(|car| car.manufacturer.name == "Toyota"));
    assert_eq!(spent, 3, "session lookup + count + joined page");
}

#[tokio::test]
async fn detail_of_missing_records_is_not_found() {
    let app = test_app().await;
    for uri in [
        "/cars/999999/",
        "/drivers/999999/",
        "/cars/999999/update/",
        "/manufacturers/999999/delete/",
    ] {
        let response = app.get(uri).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        let error: ApiError = json_body(response).await;
        assert_eq!(error.code, ErrorCode::NotFound);
    }
}

#[tokio::test]
async fn car_create_redirects_or_redisplays_errors() {
    let app = test_app().await;
    let toyota = app
        .storage
        .create_manufacturer("Toyota", "Japan")
        .await
        .expect("manufacturer");

    let response = app
        .post(
            "/cars/create/",
            serde_json::json!({ "model": "Corolla", "manufacturer": toyota.0, "drivers": [app.driver.0] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/cars/");
    assert_eq!(app.storage.count_cars(None).await.expect("count"), 1);

    let response = app
        .post("/cars/create/", serde_json::json!({ "manufacturer": toyota.0 }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let context: FormContext<CarForm> = json_body(response).await;
    assert!(context.errors.iter().any(|e| e.field == "model"));
    assert!(context.choices.is_some());
    assert_eq!(app.storage.count_cars(None).await.expect("count"), 1);
}

#[tokio::test]
async fn car_create_with_malformed_ids_redisplays_field_errors() {
    let app = test_app().await;
    app.storage
        .create_manufacturer("Toyota", "Japan")
        .await
        .expect("manufacturer");

    let response = app
        .post(
            "/cars/create/",
            serde_json::json!({ "model": "Corolla", "manufacturer": "abc", "drivers": ["x"] }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let context: FormContext<CarForm> = json_body(response).await;
    let fields: Vec<_> = context.errors.iter().map(|e| e.field.as_str()).collect();
    assert_eq!(fields, ["manufacturer", "drivers"]);
    assert!(context.errors[0].message.starts_with("Select a valid choice"));
    assert_eq!(context.choices.expect("choices").manufacturers.len(), 1);
    assert_eq!(app.storage.count_cars(None).await.expect("count"), 0);
}

#[tokio::test]
async fn unparseable_form_body_is_a_validation_error() {
    let app = test_app().await;
    for body in ["not json", r#"{"model": ["Corolla"]}"#, r#"{"manufacturer": true}"#] {
        let request = Request::post("/cars/create/")
            .header(header::COOKIE, &app.cookie)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request");
        let response = app.router.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        let error: ApiError = json_body(response).await;
        assert_eq!(error.code, ErrorCode::Validation, "{body}");
    }
    assert_eq!(app.storage.count_cars(None).await.expect("count"), 0);
}

#[tokio::test]
async fn car_update_redirects_to_its_detail_page() {
    let app = test_app().await;
    let toyota = app
        .storage
        .create_manufacturer("Toyota", "Japan")
        .await
        .expect("manufacturer");
    let car = app
        .storage
        .create_car("Corolla", toyota, &[])
        .await
        .expect("car");

    let response = app
        .post(
            &format!("/cars/{}/update/", car.0),
            serde_json::json!({ "model": "Corolla Cross", "manufacturer": toyota.0 }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), format!("/cars/{}/", car.0));

    let detail: CarDetailContext = json_body(app.get(&format!("/cars/{}/", car.0)).await).await;
    assert_eq!(detail.car.model, "Corolla Cross");
    assert!(detail.drivers.is_empty());
}

#[tokio::test]
async fn toggle_assign_adds_then_removes_the_current_driver() {
    let app = test_app().await;
    let toyota = app
        .storage
        .create_manufacturer("Toyota", "Japan")
        .await
        .expect("manufacturer");
    let car = app
        .storage
        .create_car("Corolla", toyota, &[])
        .await
        .expect("car");
    let uri = format!("/cars/{}/toggle-assign/", car.0);

    let response = app.post(&uri, serde_json::json!({})).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), format!("/cars/{}/", car.0));
    let detail: CarDetailContext = json_body(app.get(&format!("/cars/{}/", car.0)).await).await;
    assert!(detail.current_user_assigned);

    app.post(&uri, serde_json::json!({})).await;
    let detail: CarDetailContext = json_body(app.get(&format!("/cars/{}/", car.0)).await).await;
    assert!(!detail.current_user_assigned);
}

#[tokio::test]
async fn manufacturer_delete_removes_it_from_the_list() {
    let app = test_app().await;
    let doomed = app
        .storage
        .create_manufacturer("Lada", "Russia")
        .await
        .expect("manufacturer");
    app.storage
        .create_manufacturer("Skoda", "Czechia")
        .await
        .expect("manufacturer");

    let confirm: DeleteContext<Manufacturer> =
        json_body(app.get(&format!("/manufacturers/{}/delete/", doomed.0)).await).await;
    assert_eq!(confirm.object.name, "Lada");

    let response = app
        .post(&format!("/manufacturers/{}/delete/", doomed.0), serde_json::json!({}))
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/manufacturers/");

    let list: ListContext<Manufacturer> = json_body(app.get("/manufacturers/").await).await;
    assert!(list.object_list.iter().all(|m| m.id != doomed));
    assert_eq!(list.object_list.len(), 1);
}

#[tokio::test]
async fn driver_list_and_detail_know_the_current_user() {
    let app = test_app().await;
    let list: DriverListContext = json_body(app.get("/drivers/").await).await;
    assert_eq!(list.current_user_id, app.driver);
    assert_eq!(list.list.object_list.len(), 1);

    let detail: DriverDetailContext =
        json_body(app.get(&format!("/drivers/{}/", app.driver.0)).await).await;
    assert!(detail.is_current_user);
    assert_eq!(detail.driver.username, "alice");
}

#[tokio::test]
async fn driver_create_validates_license_numbers() {
    let app = test_app().await;
    let response = app
        .post(
            "/drivers/create/",
            serde_json::json!({
                "username": "bob",
                "password": "builder-pass",
                "license_number": "bad",
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let context: FormContext<DriverCreateForm> = json_body(response).await;
    assert!(context.errors.iter().any(|e| e.field == "license_number"));

    let response = app
        .post(
            "/drivers/create/",
            serde_json::json!({
                "username": "bob",
                "password": "builder-pass",
                "license_number": "BOB54321",
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/drivers/");
    assert_eq!(app.storage.count_drivers(None).await.expect("count"), 2);
}

#[tokio::test]
async fn login_sets_session_cookie_and_logout_clears_it() {
    let app = test_app().await;
    let request = Request::post("/accounts/login/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "alice", "password": "wonderland", "next": "/cars/" })
                .to_string(),
        ))
        .expect("request");
    let response = app.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/cars/");
    let set_cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("set-cookie")
        .to_string();
    assert!(set_cookie.contains("HttpOnly"));
    let cookie = set_cookie
        .split(';')
        .next()
        .expect("cookie pair")
        .to_string();

    let request = Request::get("/")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .expect("request");
    let response = app.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::post("/accounts/logout/")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .expect("request");
    let response = app.router.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/accounts/login/");

    let request = Request::get("/")
        .header(header::COOKIE, &cookie)
        .body(Body::empty())
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FOUND);
}

#[tokio::test]
async fn login_with_wrong_password_redisplays_the_form() {
    let app = test_app().await;
    let request = Request::post("/accounts/login/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "alice", "password": "nope" }).to_string(),
        ))
        .expect("request");
    let response = app.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    let context: FormContext<LoginForm> = json_body(response).await;
    assert!(!context.is_valid());
}
