use stagehand::http::response::{Response, ResponseBuilder, StatusCode};

#[test]
fn test_status_codes() {
    let table = [
        (StatusCode::Ok, 200, "OK"),
        (StatusCode::Unauthorized, 401, "Unauthorized"),
        (StatusCode::Forbidden, 403, "Forbidden"),
        (StatusCode::NotFound, 404, "Not Found"),
        (StatusCode::MethodNotAllowed, 405, "Method Not Allowed"),
        (StatusCode::InternalServerError, 500, "Internal Server Error"),
        (StatusCode::ServiceUnavailable, 503, "Service Unavailable"),
    ];

    for (status, code, phrase) in table {
        assert_eq!(status.as_u16(), code);
        assert_eq!(status.reason_phrase(), phrase);
    }
}

#[test]
fn test_builder_adds_content_length() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/plain")
        .body(b"This is the body".to_vec())
        .build();

    assert_eq!(response.header("Content-Length"), Some("16"));
    assert_eq!(response.header("content-type"), Some("text/plain"));
}

#[test]
fn test_builder_keeps_explicit_content_length() {
    let response = ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Length", "999")
        .body(b"test".to_vec())
        .build();

    assert_eq!(response.header("Content-Length"), Some("999"));
}

#[test]
fn test_not_found_page() {
    let response = Response::not_found();

    assert_eq!(response.status, StatusCode::NotFound);
    assert_eq!(response.body, b"404 Not Found".to_vec());
}

#[test]
fn test_unavailable_carries_retry_after() {
    let response = Response::unavailable("warming up", 3);

    assert_eq!(response.status, StatusCode::ServiceUnavailable);
    assert_eq!(response.header("retry-after"), Some("3"));
    assert!(String::from_utf8_lossy(&response.body).contains("warming up"));
}

#[test]
fn test_error_page() {
    let response = Response::error(StatusCode::Forbidden, "access denied");

    assert_eq!(response.status.as_u16(), 403);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body, b"403 Forbidden\r\n\r\naccess denied".to_vec());
}

#[test]
fn test_set_header_replaces_regardless_of_case() {
    let mut response = Response::new();
    response.set_header("content-type", "text/html");
    response.set_content_type("application/json");

    assert_eq!(response.headers.len(), 1);
    assert_eq!(response.header("CONTENT-TYPE"), Some("application/json"));
}

#[test]
fn test_handler_fills_blank_response() {
    let mut response = Response::new();
    response.write("hello, ");
    response.write(b"world");

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.body, b"hello, world".to_vec());
    // Left for the writer to fill in.
    assert_eq!(response.header("Content-Length"), None);
}
