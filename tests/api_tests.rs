use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{json, Value};

use likegraph_api::api::{create_router, AppState};

fn create_test_server() -> TestServer {
    let state = AppState::in_memory();
    let app = create_router(state);
    TestServer::new(app).unwrap()
}

async fn who_liked(server: &TestServer, movie: i64) -> Value {
    let response = server.get(&format!("/movie/document/{}", movie)).await;
    response.assert_status_ok();
    response.json::<Value>()["whoLiked"].clone()
}

async fn seed_scenario_a(server: &TestServer) {
    server
        .put("/movie/document/80000")
        .json(&json!([]))
        .await
        .assert_status_ok();
    server
        .put("/movie/document/80001")
        .json(&json!([]))
        .await
        .assert_status_ok();
    server
        .put("/user/document/90000")
        .json(&json!([80000, 80001]))
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_health_check() {
    let server = create_test_server();
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn test_add_user_links_movies() {
    let server = create_test_server();
    seed_scenario_a(&server).await;

    assert_eq!(who_liked(&server, 80000).await, json!([90000]));
    assert_eq!(who_liked(&server, 80001).await, json!([90000]));

    let response = server.get("/user/document/90000").await;
    response.assert_status_ok();
    response.assert_json(&json!({"likedMovies": [80000, 80001]}));
}

#[tokio::test]
async fn test_bulk_update_users_moves_links() {
    let server = create_test_server();
    seed_scenario_a(&server).await;

    let response = server
        .post("/user/bulk")
        .json(&json!([{"id": 90000, "likedMovies": [80000, 80002]}]))
        .await;
    response.assert_status_ok();
    response.assert_text("Ok");

    assert_eq!(who_liked(&server, 80000).await, json!([90000]));
    assert_eq!(who_liked(&server, 80001).await, json!([]));
    assert_eq!(who_liked(&server, 80002).await, json!([90000]));
}

#[tokio::test]
async fn test_delete_user_unlinks_movies() {
    let server = create_test_server();
    seed_scenario_a(&server).await;
    server
        .post("/user/bulk")
        .json(&json!([{"user_id": 90000, "liked_movies": [80000, 80002]}]))
        .await
        .assert_status_ok();

    server
        .delete("/user/document/90000")
        .await
        .assert_status_ok();

    let response = server.get("/user/document/90000").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert!(response.json::<Value>()["error"].is_string());

    assert_eq!(who_liked(&server, 80000).await, json!([]));
    assert_eq!(who_liked(&server, 80002).await, json!([]));
}

#[tokio::test]
async fn test_user_preselection() {
    let server = create_test_server();
    for (user, liked) in [(1, json!([1, 2])), (2, json!([2, 3])), (3, json!([4]))] {
        server
            .put(&format!("/user/document/{}", user))
            .json(&liked)
            .await
            .assert_status_ok();
    }

    let response = server.get("/user/preselection/1").await;
    response.assert_status_ok();
    response.assert_json(&json!({"moviesFound": [3]}));
}

#[tokio::test]
async fn test_movie_side_mirrors_user_side() {
    let server = create_test_server();
    server
        .put("/movie/document/10")
        .json(&json!([1, 2]))
        .await
        .assert_status_ok();
    server
        .put("/movie/document/11")
        .json(&json!([2, 3]))
        .await
        .assert_status_ok();

    let response = server.get("/user/document/2").await;
    response.assert_json(&json!({"likedMovies": [10, 11]}));

    let response = server.get("/movie/preselection/10").await;
    response.assert_status_ok();
    response.assert_json(&json!({"usersFound": [3]}));

    server
        .post("/movie/bulk")
        .json(&json!([{"movie_id": 11, "users_who_liked_movie": [3]}]))
        .await
        .assert_status_ok();
    let response = server.get("/user/document/2").await;
    response.assert_json(&json!({"likedMovies": [10]}));
}

#[tokio::test]
async fn test_update_does_not_propagate() {
    let server = create_test_server();
    server
        .put("/movie/document/5")
        .json(&json!([]))
        .await
        .assert_status_ok();
    server
        .post("/user/document/7")
        .json(&json!([5]))
        .await
        .assert_status_ok();

    server
        .get("/user/document/7")
        .await
        .assert_json(&json!({"likedMovies": [5]}));
    assert_eq!(who_liked(&server, 5).await, json!([]));
}

#[tokio::test]
async fn test_missing_documents_are_not_found() {
    let server = create_test_server();

    server
        .get("/user/document/404")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .get("/movie/preselection/404")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .delete("/movie/document/404")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_input_is_bad_request() {
    let server = create_test_server();

    server
        .get("/user/document/abc")
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let response = server
        .put("/user/document/1")
        .json(&json!({"likedMovies": [1]}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(response.json::<Value>()["error"].is_string());

    server
        .post("/user/bulk")
        .json(&json!([{"id": 1}]))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_collection_query_params() {
    let server = create_test_server();
    server
        .put("/user/document/1")
        .add_query_param("user_index", "users_v2")
        .add_query_param("movie_index", "movies_v2")
        .json(&json!([3]))
        .await
        .assert_status_ok();

    server
        .get("/user/document/1")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    server
        .get("/user/document/1")
        .add_query_param("user_index", "users_v2")
        .await
        .assert_json(&json!({"likedMovies": [3]}));
    server
        .get("/movie/document/3")
        .add_query_param("movie_index", "movies_v2")
        .await
        .assert_json(&json!({"whoLiked": [1]}));
}

#[tokio::test]
async fn test_index_management() {
    let server = create_test_server();

    server.put("/indices/users").await.assert_status_ok();
    server
        .put("/indices/users")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .put("/user/document/1")
        .json(&json!([2]))
        .await
        .assert_status_ok();

    server
        .post("/reindex")
        .json(&json!({"source": "users", "dest": "users_backup"}))
        .await
        .assert_status_ok();
    server
        .get("/user/document/1")
        .add_query_param("user_index", "users_backup")
        .await
        .assert_json(&json!({"likedMovies": [2]}));

    let indices: Vec<String> = server.get("/indices").await.json();
    assert_eq!(indices, vec!["movies", "users", "users_backup"]);

    server.delete("/indices/users").await.assert_status_ok();
    let indices: Vec<String> = server.get("/indices").await.json();
    assert_eq!(indices, vec!["movies", "users_backup"]);

    server
        .post("/reindex")
        .json(&json!({"source": "missing", "dest": "x"}))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let server = create_test_server();
    let response = server
        .get("/health")
        .add_header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("trace-abc-123"),
        )
        .await;
    assert_eq!(response.header("x-request-id"), "trace-abc-123");

    let response = server.get("/health").await;
    let generated = response.header("x-request-id");
    assert_eq!(generated.to_str().unwrap().len(), 36);
}

#[tokio::test]
async fn test_unsafe_collection_names_are_rejected() {
    let server = create_test_server();

    let response = server
        .get("/user/document/1")
        .add_query_param("user_index", "")
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert!(response.json::<Value>()["error"].is_string());

    server
        .put("/user/document/1")
        .add_query_param("movie_index", "movies*")
        .json(&json!([2]))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .put("/indices/users:shadow")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .delete("/indices/users*")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/reindex")
        .json(&json!({"source": "users", "dest": ""}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    // nothing was written by the rejected requests
    let indices: Vec<String> = server.get("/indices").await.json();
    assert!(indices.is_empty());
}
