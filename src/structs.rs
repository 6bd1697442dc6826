use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub pwd_hash: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub logo_url: Option<String>,
    pub address: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A company as seen by one of its members.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, FromRow)]
pub struct MemberCompany {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub company: Company,
    pub role: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, FromRow)]
pub struct PermissionRule {
    pub role: String,
    pub resource: String,
    pub action: String,
}

/// Roles a member can hold inside a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Founder,
    Manager,
    FrontOfHouse,
    Instructor,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Founder,
        Role::Manager,
        Role::FrontOfHouse,
        Role::Instructor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Founder => "founder",
            Role::Manager => "manager",
            Role::FrontOfHouse => "front_of_house",
            Role::Instructor => "instructor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown role: {}", s))
    }
}

/// JSON envelope shared by every API endpoint.
#[derive(Serialize, Deserialize, Debug)]
pub struct FunctionResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> FunctionResponse<T> {
    pub fn ok(data: T) -> Self {
        FunctionResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        FunctionResponse {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
