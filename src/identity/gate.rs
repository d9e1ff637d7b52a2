//! Route gating: which of five mutually exclusive views a session may see, and
//! what each application route does for that view.

use serde::Serialize;

use super::principal::Role;
use super::resolver::RoleResolution;
use super::session::SessionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVariant {
    Unauthenticated,
    Loading,
    Student,
    StaffOrAdmin,
    /// Authenticated, but the role is unrecognised or could not be fetched.
    Unknown,
}

impl GateVariant {
    /// Landing route of an authenticated variant.
    pub fn home(&self) -> Option<Route> {
        match self {
            GateVariant::Student => Some(Route::Student),
            GateVariant::StaffOrAdmin => Some(Route::Admin),
            _ => None,
        }
    }
}

/// Pure and idempotent: the same inputs always give the same variant.
pub fn decide(snapshot: &SessionSnapshot, resolution: &RoleResolution) -> GateVariant {
    if snapshot.loading {
        return GateVariant::Loading;
    }
    if snapshot.session.is_none() {
        return GateVariant::Unauthenticated;
    }
    match resolution {
        RoleResolution::NotFetched | RoleResolution::Fetching => GateVariant::Loading,
        RoleResolution::Resolved(Role::Student) => GateVariant::Student,
        RoleResolution::Resolved(Role::Teacher | Role::Admin) => GateVariant::StaffOrAdmin,
        RoleResolution::Resolved(Role::Unknown) | RoleResolution::Failed(_) => GateVariant::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    Landing,
    Auth,
    Student,
    Admin,
    Notebooks,
    Notebook(String),
    NotFound(String),
}

impl Route {
    pub fn parse(path: &str) -> Route {
        let trimmed = path.split(['?', '#']).next().unwrap_or("");
        let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Route::Landing,
            ["auth"] => Route::Auth,
            ["student"] => Route::Student,
            ["admin"] => Route::Admin,
            ["notebook"] => Route::Notebooks,
            ["notebook", id] => Route::Notebook((*id).to_string()),
            _ => Route::NotFound(path.to_string()),
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Landing => "/".into(),
            Route::Auth => "/auth".into(),
            Route::Student => "/student".into(),
            Route::Admin => "/admin".into(),
            Route::Notebooks => "/notebook".into(),
            Route::Notebook(id) => format!("/notebook/{}", id),
            Route::NotFound(p) => p.clone(),
        }
    }

    fn allows(&self, variant: GateVariant) -> bool {
        match self {
            Route::Student => variant == GateVariant::Student,
            Route::Admin => variant == GateVariant::StaffOrAdmin,
            Route::Notebooks | Route::Notebook(_) => {
                matches!(variant, GateVariant::Student | GateVariant::StaffOrAdmin)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "to", rename_all = "snake_case")]
pub enum RouteDecision {
    Render,
    Redirect(String),
    ShowLoading,
    ShowFallback,
}

pub fn route_decision(route: &Route, variant: GateVariant) -> RouteDecision {
    match route {
        Route::Landing | Route::NotFound(_) => RouteDecision::Render,
        Route::Auth => match variant {
            GateVariant::Unauthenticated => RouteDecision::Render,
            GateVariant::Loading => RouteDecision::ShowLoading,
            GateVariant::Unknown => RouteDecision::ShowFallback,
            GateVariant::Student | GateVariant::StaffOrAdmin => redirect_home(variant),
        },
        guarded => match variant {
            GateVariant::Unauthenticated => RouteDecision::Redirect(Route::Auth.path()),
            GateVariant::Loading => RouteDecision::ShowLoading,
            GateVariant::Unknown => RouteDecision::ShowFallback,
            v if guarded.allows(v) => RouteDecision::Render,
            v => redirect_home(v),
        },
    }
}

fn redirect_home(variant: GateVariant) -> RouteDecision {
    match variant.home() {
        Some(home) => RouteDecision::Redirect(home.path()),
        None => RouteDecision::ShowFallback,
    }
}
