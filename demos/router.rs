//! A small routed server built on Ferrite.
//! Demonstrates path parameters, shared state, filters, a WebSocket echo
//! endpoint and a server-sent event feed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ferrite::{
    filter, filters, BoxHandler, ErrorKind, Event, EventBroadcast, ExceptionsFilter, Request,
    Response, Result, Routes, Server, ServerConfig,
};

async fn index(_request: Request) -> Result<Response> {
    Ok(Response::ok().text("Welcome to Ferrite!"))
}

async fn hello(request: Request) -> Result<Response> {
    let name = request.path_params().get("name").unwrap_or("world");
    Ok(Response::ok().text(format!("Hello, {}!", name)))
}

async fn echo(_request: Request) -> Result<Response> {
    Ok(Response::ok().websocket(|channel| {
        let out = channel.clone();
        channel.on_text(move |text| {
            let _ = out.write_text(text);
        });
    }))
}

/// Adds the time spent in the handler to every response.
async fn timing(request: Request, next: BoxHandler) -> Result<Response> {
    let started = std::time::Instant::now();
    let response = next.call(request).await?;
    Ok(response.header("x-elapsed-us", started.elapsed().as_micros().to_string()))
}

#[tokio::main]
async fn main() {
    let counter = Arc::new(AtomicU64::new(0));
    let feed = EventBroadcast::new();

    let count = {
        let counter = counter.clone();
        let feed = feed.clone();
        move |_request: Request| {
            let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
            feed.broadcast(Event::new(value.to_string()).name("counter"));
            async move { Result::Ok(Response::ok().text(format!("Counter: {}", value))) }
        }
    };
    let events = {
        let feed = feed.clone();
        move |_request: Request| {
            let response = feed.subscribe();
            async move { Result::Ok(response) }
        }
    };

    let routes = Routes::new()
        .get("/", index)
        .get("/hello/:name", hello)
        .get("/counter", count)
        .get("/events", events)
        .get("/echo", echo);

    let exceptions = ExceptionsFilter::new().on_kind(ErrorKind::Request, |_request: &Request, error| {
        Ok(Response::bad_request().text(format!("Bad request: {}", error)))
    });

    let config = ServerConfig::new().unwrap_or_default();
    let address = config.address();

    println!("Server running at http://{}", address);
    println!("Try these routes:");
    println!("  - /");
    println!("  - /hello/your-name");
    println!("  - /counter (increments on each visit)");
    println!("  - /events (server-sent counter updates)");
    println!("  - /echo (WebSocket echo)");

    Server::new(config)
        .routes(routes)
        .filter(filter(filters([filter(timing), filter(exceptions)])))
        .serve()
        .await
        .expect("Server failed to start");
}
