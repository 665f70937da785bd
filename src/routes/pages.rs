use axum::Router;
use std::path::Path;
use tower_http::services::ServeFile;

const PAGES: [(&str, &str); 5] = [
    ("/", "index.html"),
    ("/home", "home.html"),
    ("/about", "about.html"),
    ("/contact", "contact.html"),
    ("/service", "service.html"),
];

pub fn page_routes<S>(templates_dir: &Path) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    PAGES
        .iter()
        .fold(Router::new(), |router, (route, file)| {
            router.route_service(route, ServeFile::new(templates_dir.join(file)))
        })
}
