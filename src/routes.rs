use actix_identity::Identity;
use actix_session::Session;
use actix_web::{
    get,
    http::StatusCode,
    post,
    web::{self, Data},
    HttpMessage, HttpRequest, HttpResponse, Responder,
};
use serde::{Deserialize, Serialize};
use tera::Context;

use crate::{
    bootstrap::Notice,
    db,
    errors::AppError,
    guards::{self, see_other, CompanyContext, CompanyGate, Gate, RETURN_TO},
    permissions::Action,
    session::{self, CurrentCompany},
    structs::{FunctionResponse, Role},
    utils::{safe_return_path, validate_password, verify_password},
    AppState, TEMPLATES,
};

/// Resources listed on the dashboard when the role may view them.
const DASHBOARD_RESOURCES: [&str; 7] = [
    "dashboard",
    "rota",
    "staff",
    "payroll",
    "transactions",
    "knowledge_base",
    "settings",
];

const SETTINGS_ROLES: [Role; 3] = [Role::Admin, Role::Founder, Role::Manager];

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(index_handler)
        .service(login_handler)
        .service(login_form_handler)
        .service(register_handler)
        .service(register_form_handler)
        .service(logout_handler)
        .service(select_company_handler)
        .service(select_company_form_handler)
        .service(create_company_handler)
        .service(dashboard_handler)
        .service(company_settings_handler)
        .service(company_settings_form_handler)
        .service(api_session_handler)
        .service(api_permission_check_handler)
        .service(api_permission_reload_handler);
}

fn render(template: &str, context: &Context, status: StatusCode) -> Result<HttpResponse, AppError> {
    let rendered = TEMPLATES.render(template, context).map_err(|e| {
        log::error!("Failed to render template {}: {}", template, e);
        AppError::TemplateError(e)
    })?;

    Ok(HttpResponse::build(status)
        .content_type("text/html; charset=utf-8")
        .body(rendered))
}

fn page_context(title: &str, signed_in: bool) -> Context {
    let mut context = Context::new();
    context.insert("title", title);
    context.insert("signed_in", &signed_in);
    context.insert("version", env!("CARGO_PKG_VERSION"));
    context
}

fn login_page(error: Option<&str>, status: StatusCode) -> Result<HttpResponse, AppError> {
    let mut context = page_context("Log in", false);
    context.insert("error", &error);
    render("login.html", &context, status)
}

fn register_page(error: Option<&str>, status: StatusCode) -> Result<HttpResponse, AppError> {
    let mut context = page_context("Register", false);
    context.insert("error", &error);
    render("register.html", &context, status)
}

#[get("/")]
pub async fn index_handler() -> impl Responder {
    see_other("/dashboard")
}

#[derive(Deserialize)]
pub struct LoginQuery {
    next: Option<String>,
}

#[get("/login")]
pub async fn login_handler(
    query: web::Query<LoginQuery>,
    session: Session,
) -> Result<impl Responder, AppError> {
    if let Some(next) = &query.next {
        session.insert(RETURN_TO, safe_return_path(Some(next.as_str())))?;
    }
    login_page(None, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct Login {
    email: String,
    password: String,
}

#[post("/login")]
pub async fn login_form_handler(
    web::Form(form): web::Form<Login>,
    state: Data<AppState>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    if form.email.is_empty() || form.password.is_empty() {
        return login_page(Some("All fields are required"), StatusCode::BAD_REQUEST);
    }
    if !form.email.contains('@') {
        return login_page(Some("Invalid email address"), StatusCode::BAD_REQUEST);
    }
    let lc_email = form.email.trim().to_lowercase();

    let Some(user) = db::get_user_by_email(&state, &lc_email).await? else {
        return login_page(Some("Invalid credentials"), StatusCode::UNAUTHORIZED);
    };

    match verify_password(&form.password, &user.pwd_hash) {
        Ok(true) => {}
        Ok(false) => return login_page(Some("Invalid credentials"), StatusCode::UNAUTHORIZED),
        Err(e) => {
            log::error!("Stored hash for user {} is unreadable: {}", user.id, e);
            return login_page(Some("Invalid credentials"), StatusCode::UNAUTHORIZED);
        }
    }

    Identity::login(&request.extensions(), user.id.to_string())?;
    log::info!("User {} logged in", user.id);

    let return_to = session.remove_as::<String>(RETURN_TO).and_then(Result::ok);
    Ok(see_other(&safe_return_path(return_to.as_deref())))
}

#[derive(Deserialize)]
pub struct Register {
    email: String,
    password: String,
    password2: String,
    company: String,
}

#[get("/register")]
pub async fn register_handler() -> Result<impl Responder, AppError> {
    register_page(None, StatusCode::OK)
}

#[post("/register")]
pub async fn register_form_handler(
    web::Form(form): web::Form<Register>,
    state: Data<AppState>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    if form.email.is_empty()
        || form.password.is_empty()
        || form.password2.is_empty()
        || form.company.trim().is_empty()
    {
        return register_page(Some("All fields are required"), StatusCode::BAD_REQUEST);
    }
    if form.password != form.password2 {
        return register_page(Some("Passwords do not match"), StatusCode::BAD_REQUEST);
    }
    if !form.email.contains('@') {
        return register_page(Some("Invalid email address"), StatusCode::BAD_REQUEST);
    }
    if let Err(msg) = validate_password(&form.password) {
        return register_page(Some(msg), StatusCode::BAD_REQUEST);
    }

    let lc_email = form.email.trim().to_lowercase();
    let registered = db::register_user_with_company(
        &state,
        lc_email,
        &form.password,
        form.company.trim(),
        Role::Admin,
    )
    .await;
    let (user, company) = match registered {
        Ok(pair) => pair,
        Err(AppError::Conflict(msg)) => {
            return register_page(Some(&msg), StatusCode::CONFLICT);
        }
        Err(e) => return Err(e),
    };

    Identity::login(&request.extensions(), user.id.to_string())?;
    session::select_company(&session, &company)?;

    Ok(see_other("/dashboard"))
}

#[post("/logout")]
pub async fn logout_handler(identity: Option<Identity>, session: Session) -> impl Responder {
    session::clear_company(&session);
    if let Some(identity) = identity {
        identity.logout();
    }
    see_other("/login")
}

#[derive(Deserialize)]
pub struct SelectQuery {
    notice: Option<String>,
}

#[get("/select-company")]
pub async fn select_company_handler(
    query: web::Query<SelectQuery>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let user_id = match guards::require_user(&request, identity.as_ref(), &session)? {
        Gate::Open(user_id) => user_id,
        Gate::Redirect(resp) => return Ok(resp),
    };

    let companies = db::companies_for_user(&state.db_pool, user_id).await?;
    let current = session::current_company(&session)?;
    let notice = query.notice.as_deref().and_then(Notice::from_code).map(|n| n.message());

    let mut context = page_context("Choose a company", true);
    context.insert("companies", &companies);
    context.insert("current_id", &current.map(|c| c.id));
    context.insert("notice", &notice);
    render("select_company.html", &context, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct SelectCompanyForm {
    company_id: i64,
}

#[post("/select-company")]
pub async fn select_company_form_handler(
    web::Form(form): web::Form<SelectCompanyForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let user_id = match guards::require_user(&request, identity.as_ref(), &session)? {
        Gate::Open(user_id) => user_id,
        Gate::Redirect(resp) => return Ok(resp),
    };

    let companies = db::companies_for_user(&state.db_pool, user_id).await?;
    let Some(member) = companies.iter().find(|c| c.company.id == form.company_id) else {
        log::warn!("User {} tried to select foreign company {}", user_id, form.company_id);
        return Err(AppError::Forbidden);
    };

    session::select_company(&session, &member.company)?;
    Ok(see_other("/dashboard"))
}

#[derive(Deserialize)]
pub struct CreateCompanyForm {
    name: String,
}

#[post("/companies")]
pub async fn create_company_handler(
    web::Form(form): web::Form<CreateCompanyForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let user_id = match guards::require_user(&request, identity.as_ref(), &session)? {
        Gate::Open(user_id) => user_id,
        Gate::Redirect(resp) => return Ok(resp),
    };

    let name = form.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Ok(HttpResponse::BadRequest().body("Company name must be 1 to 100 characters"));
    }

    let company = db::create_company_for_user(&state, user_id, name, Role::Admin).await?;
    session::select_company(&session, &company)?;
    Ok(see_other("/dashboard"))
}

#[get("/dashboard")]
pub async fn dashboard_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let ctx = match guards::require_company(&request, &state, identity.as_ref(), &session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(resp),
    };

    let rules = state.permissions.get(&state.db_pool).await;
    let resources: Vec<&str> = DASHBOARD_RESOURCES
        .into_iter()
        .filter(|r| rules.resolve(Some(ctx.role.as_str()), r, Action::View))
        .collect();
    let can_manage_settings = ctx.role().is_some_and(|r| SETTINGS_ROLES.contains(&r));

    let mut context = page_context("Dashboard", true);
    context.insert("company", &ctx.company);
    context.insert("role", &ctx.role);
    context.insert("resources", &resources);
    context.insert("can_manage_settings", &can_manage_settings);
    render("dashboard.html", &context, StatusCode::OK)
}

async fn settings_context(
    request: &HttpRequest,
    state: &AppState,
    identity: Option<&Identity>,
    session: &Session,
) -> Result<Gate<CompanyContext>, AppError> {
    let ctx = match guards::require_company(request, state, identity, session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(Gate::Redirect(resp)),
    };
    match guards::require_role(&ctx, &SETTINGS_ROLES, None) {
        Gate::Open(()) => Ok(Gate::Open(ctx)),
        Gate::Redirect(resp) => Ok(Gate::Redirect(resp)),
    }
}

#[get("/settings/company")]
pub async fn company_settings_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let ctx = match settings_context(&request, &state, identity.as_ref(), &session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(resp),
    };

    let mut context = page_context("Company settings", true);
    context.insert("company", &ctx.company);
    render("settings.html", &context, StatusCode::OK)
}

#[derive(Deserialize)]
pub struct CompanySettingsForm {
    name: String,
    logo_url: Option<String>,
    address: Option<String>,
}

#[post("/settings/company")]
pub async fn company_settings_form_handler(
    web::Form(form): web::Form<CompanySettingsForm>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let ctx = match settings_context(&request, &state, identity.as_ref(), &session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(resp),
    };

    let rules = state.permissions.get(&state.db_pool).await;
    if !rules.resolve(Some(ctx.role.as_str()), "settings", Action::Edit) {
        return Err(AppError::Forbidden);
    }

    let name = form.name.trim();
    if name.is_empty() || name.len() > 100 {
        return Ok(HttpResponse::BadRequest().body("Company name must be 1 to 100 characters"));
    }

    let company = db::update_company(
        &state,
        ctx.company.id,
        Some(name.to_owned()),
        Some(form.logo_url.as_deref().and_then(non_blank)),
        Some(form.address.as_deref().and_then(non_blank)),
    )
    .await?;
    session::select_company(&session, &company)?;

    Ok(see_other("/settings/company"))
}

fn non_blank(value: &str) -> Option<String> {
    match value.trim() {
        "" => None,
        trimmed => Some(trimmed.to_owned()),
    }
}

fn api_denied(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(FunctionResponse::<()>::err(message))
}

async fn api_context(
    request: &HttpRequest,
    state: &AppState,
    identity: Option<&Identity>,
    session: &Session,
) -> Result<Gate<CompanyContext>, AppError> {
    if session::user_id(identity)?.is_none() {
        return Ok(Gate::Redirect(api_denied(StatusCode::UNAUTHORIZED, "Not signed in")));
    }
    match guards::resolve_company_context(request, state, identity, session).await? {
        CompanyGate::Ready(ctx) | CompanyGate::AutoSelected(ctx) => Ok(Gate::Open(ctx)),
        CompanyGate::Redirect(_) => Ok(Gate::Redirect(api_denied(
            StatusCode::CONFLICT,
            "No company selected",
        ))),
    }
}

#[derive(Serialize)]
struct SessionInfo {
    user_id: i64,
    company: CurrentCompany,
    role: String,
}

#[get("/api/session")]
pub async fn api_session_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let ctx = match api_context(&request, &state, identity.as_ref(), &session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(resp),
    };

    Ok(HttpResponse::Ok().json(FunctionResponse::ok(SessionInfo {
        user_id: ctx.user_id,
        company: CurrentCompany::from(&ctx.company),
        role: ctx.role,
    })))
}

#[derive(Deserialize)]
pub struct PermissionQuery {
    resource: String,
    action: String,
}

#[derive(Serialize)]
struct PermissionAnswer {
    resource: String,
    action: Action,
    allowed: bool,
}

#[get("/api/permissions/check")]
pub async fn api_permission_check_handler(
    query: web::Query<PermissionQuery>,
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let ctx = match api_context(&request, &state, identity.as_ref(), &session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(resp),
    };
    let query = query.into_inner();
    let action = match query.action.parse::<Action>() {
        Ok(action) => action,
        Err(e) => return Ok(api_denied(StatusCode::BAD_REQUEST, &e)),
    };

    let rules = state.permissions.get(&state.db_pool).await;
    let allowed = rules.resolve(Some(ctx.role.as_str()), &query.resource, action);
    Ok(HttpResponse::Ok().json(FunctionResponse::ok(PermissionAnswer {
        resource: query.resource,
        action,
        allowed,
    })))
}

#[post("/api/permissions/reload")]
pub async fn api_permission_reload_handler(
    state: Data<AppState>,
    identity: Option<Identity>,
    session: Session,
    request: HttpRequest,
) -> Result<impl Responder, AppError> {
    let ctx = match api_context(&request, &state, identity.as_ref(), &session).await? {
        Gate::Open(ctx) => ctx,
        Gate::Redirect(resp) => return Ok(resp),
    };
    if !matches!(ctx.role(), Some(Role::Admin | Role::Founder)) {
        return Ok(api_denied(StatusCode::FORBIDDEN, "Only admins can reload permissions"));
    }

    state.permissions.reload(&state.db_pool).await;
    log::info!("Permission rules reloaded by user {}", ctx.user_id);
    Ok(HttpResponse::Ok().json(FunctionResponse::ok(true)))
}
