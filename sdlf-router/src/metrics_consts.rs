pub const EVENTS_ROUTED: &str = "sdlf_router_events_total";
pub const EVENT_ERRORS: &str = "sdlf_router_event_errors_total";
pub const ROUTE_TIME: &str = "sdlf_router_route_ms";
