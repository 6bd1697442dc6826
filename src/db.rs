use sqlx::{SqliteConnection, SqlitePool};

use crate::{
    errors::AppError,
    structs::{Company, MemberCompany, PermissionRule, Role, User},
    utils::{hash_password, slugify},
    AppState,
};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub async fn get_user_by_email(state: &AppState, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(&state.db_pool)
        .await
}

fn hashed(password: &str) -> Result<String, AppError> {
    hash_password(password).map_err(|e| {
        log::error!("Failed to hash password: {}", e);
        AppError::PasswordError(e.to_string())
    })
}

async fn insert_user(
    conn: &mut SqliteConnection,
    email: String,
    pwd_hash: String,
) -> Result<User, AppError> {
    let created_at = now();
    sqlx::query_as::<_, User>(
        "INSERT INTO users (email, pwd_hash, created_at, updated_at) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(email)
    .bind(pwd_hash)
    .bind(&created_at)
    .bind(&created_at)
    .fetch_one(conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict("Email is already registered".to_owned())
        }
        e => AppError::DatabaseError(e),
    })
}

#[cfg(test)]
pub async fn create_user(state: &AppState, email: String, password: &str) -> Result<User, AppError> {
    let pwd_hash = hashed(password)?;
    let mut conn = state.db_pool.acquire().await?;
    let user = insert_user(&mut conn, email, pwd_hash).await?;
    log::info!("User created: {}", user.id);
    Ok(user)
}

/// Sign-up: the user, their first company and the membership are written
/// together or not at all.
pub async fn register_user_with_company(
    state: &AppState,
    email: String,
    password: &str,
    company_name: &str,
    role: Role,
) -> Result<(User, Company), AppError> {
    let pwd_hash = hashed(password)?;
    let slug = unique_slug(state, company_name).await?;

    let mut tx = state.db_pool.begin().await?;
    let user = insert_user(&mut tx, email, pwd_hash).await?;
    let company = insert_company_with_member(&mut tx, user.id, company_name, &slug, role).await?;
    tx.commit().await?;

    log::info!("User {} registered with company {} ({})", user.id, company.id, company.slug);
    Ok((user, company))
}

pub async fn get_company_by_slug(state: &AppState, slug: &str) -> Result<Option<Company>, sqlx::Error> {
    sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE slug = $1")
        .bind(slug)
        .fetch_optional(&state.db_pool)
        .await
}

/// All companies the user belongs to, oldest membership first.
pub async fn companies_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<MemberCompany>, sqlx::Error> {
    sqlx::query_as::<_, MemberCompany>(
        r#"
        SELECT c.id, c.name, c.slug, c.logo_url, c.address, c.created_at, c.updated_at, cu.role
        FROM company_users cu
        JOIN companies c ON c.id = cu.company_id
        WHERE cu.user_id = $1
        ORDER BY cu.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
}

async fn unique_slug(state: &AppState, name: &str) -> Result<String, sqlx::Error> {
    let base = match slugify(name) {
        s if s.is_empty() => "company".to_owned(),
        s => s,
    };
    let mut candidate = base.clone();
    let mut n = 2;
    while get_company_by_slug(state, &candidate).await?.is_some() {
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
    Ok(candidate)
}

async fn insert_company_with_member(
    conn: &mut SqliteConnection,
    user_id: i64,
    name: &str,
    slug: &str,
    role: Role,
) -> Result<Company, sqlx::Error> {
    let created_at = now();
    let company = sqlx::query_as::<_, Company>(
        "INSERT INTO companies (name, slug, created_at, updated_at) VALUES ($1, $2, $3, $4) RETURNING *",
    )
    .bind(name)
    .bind(slug)
    .bind(&created_at)
    .bind(&created_at)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO company_users (user_id, company_id, role, created_at) VALUES ($1, $2, $3, $4)")
        .bind(user_id)
        .bind(company.id)
        .bind(role.as_str())
        .bind(&created_at)
        .execute(&mut *conn)
        .await?;
    Ok(company)
}

/// Creates a company and makes `user_id` a member of it with `role`.
pub async fn create_company_for_user(
    state: &AppState,
    user_id: i64,
    name: &str,
    role: Role,
) -> Result<Company, AppError> {
    let slug = unique_slug(state, name).await?;

    let mut tx = state.db_pool.begin().await?;
    let company = insert_company_with_member(&mut tx, user_id, name, &slug, role).await?;
    tx.commit().await?;

    log::info!("Company {} ({}) created for user {}", company.id, company.slug, user_id);
    Ok(company)
}

/// `None` leaves a column alone; `Some(None)` clears an optional column.
pub async fn update_company(
    state: &AppState,
    id: i64,
    name: Option<String>,
    logo_url: Option<Option<String>>,
    address: Option<Option<String>>,
) -> Result<Company, AppError> {
    let mut param_index = 2;
    let mut query = String::from("UPDATE companies SET updated_at = $1");

    if name.is_some() {
        query.push_str(&format!(", name = ${}", param_index));
        param_index += 1;
    }
    if logo_url.is_some() {
        query.push_str(&format!(", logo_url = ${}", param_index));
        param_index += 1;
    }
    if address.is_some() {
        query.push_str(&format!(", address = ${}", param_index));
        param_index += 1;
    }
    query.push_str(&format!(" WHERE id = ${} RETURNING *", param_index));

    let mut q = sqlx::query_as::<_, Company>(&query).bind(now());
    if let Some(name) = &name {
        q = q.bind(name);
    }
    if let Some(logo_url) = &logo_url {
        q = q.bind(logo_url);
    }
    if let Some(address) = &address {
        q = q.bind(address);
    }
    q = q.bind(id);

    let company = q.fetch_optional(&state.db_pool).await?.ok_or(AppError::NotFound)?;
    log::info!("Company updated: {}", company.id);
    Ok(company)
}

pub async fn active_permission_rules(pool: &SqlitePool) -> Result<Vec<PermissionRule>, sqlx::Error> {
    sqlx::query_as::<_, PermissionRule>(
        "SELECT role, resource, action FROM role_permissions WHERE is_active = 1 AND allowed = 1",
    )
    .fetch_all(pool)
    .await
}
