use super::{Storage, StorageError};
use std::collections::HashMap;

const ROUTE_PREFIX: &str = "im:gw:route:";

const SET_AND_GET_OLD: &str = r#"
local old = redis.call('GET', KEYS[1])
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
if old then return old else return '' end
"#;

const EXPIRE_IF_MATCH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DEL_IF_MATCH: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Location of a live connection: owning gateway instance plus the
/// connection identifier on that instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub instance_id: String,
    pub connection_id: Option<String>,
}

/// Encodes a route value as `instance|connection`.
pub fn format_route(instance_id: &str, connection_id: Option<&str>) -> String {
    match connection_id {
        Some(connection) => format!("{}|{}", instance_id, connection),
        None => instance_id.to_string(),
    }
}

/// Decodes a route value. Values written by older gateway builds carry
/// only the instance part and are still accepted.
pub fn parse_route(value: &str) -> Option<RouteInfo> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once('|') {
        Some((instance, connection)) => Some(RouteInfo {
            instance_id: instance.to_string(),
            connection_id: if connection.is_empty() {
                None
            } else {
                Some(connection.to_string())
            },
        }),
        None => Some(RouteInfo {
            instance_id: trimmed.to_string(),
            connection_id: None,
        }),
    }
}

fn route_key(user_id: i64) -> String {
    format!("{}{}", ROUTE_PREFIX, user_id)
}

impl Storage {
    /// Binds a user's route to this instance and returns the previous
    /// route, if any. Write and read happen in one script so a racing
    /// bind on another instance cannot be lost between them.
    pub async fn set_route_and_get_old(
        &self,
        user_id: i64,
        instance_id: &str,
        connection_id: &str,
        ttl_seconds: i64,
    ) -> Result<Option<RouteInfo>, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let old: String = redis::Script::new(SET_AND_GET_OLD)
            .key(route_key(user_id))
            .arg(format_route(instance_id, Some(connection_id)))
            .arg(ttl_seconds.max(1))
            .invoke_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(parse_route(&old))
    }

    /// Re-establishes a route that has lapsed. Does nothing while any
    /// connection still owns the binding, so a surviving older device
    /// regains presence without stealing it from a live newer one.
    pub async fn claim_route_if_vacant(
        &self,
        user_id: i64,
        instance_id: &str,
        connection_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let claimed: Option<String> = redis::cmd("SET")
            .arg(route_key(user_id))
            .arg(format_route(instance_id, Some(connection_id)))
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(claimed.is_some())
    }

    /// Refreshes the route TTL, but only while this connection still owns
    /// the binding. Returns false when the route has moved elsewhere.
    pub async fn renew_route_if_owner(
        &self,
        user_id: i64,
        instance_id: &str,
        connection_id: &str,
        ttl_seconds: i64,
    ) -> Result<bool, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let renewed: i64 = redis::Script::new(EXPIRE_IF_MATCH)
            .key(route_key(user_id))
            .arg(format_route(instance_id, Some(connection_id)))
            .arg(ttl_seconds.max(1))
            .invoke_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(renewed == 1)
    }

    /// Removes the route, but only while this connection still owns the
    /// binding. A superseding login keeps its fresh route intact.
    pub async fn delete_route_if_owner(
        &self,
        user_id: i64,
        instance_id: &str,
        connection_id: &str,
    ) -> Result<bool, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let deleted: i64 = redis::Script::new(DEL_IF_MATCH)
            .key(route_key(user_id))
            .arg(format_route(instance_id, Some(connection_id)))
            .invoke_async(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(deleted == 1)
    }

    /// Looks up a single user's route.
    pub async fn route_of(&self, user_id: i64) -> Result<Option<RouteInfo>, StorageError> {
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(route_key(user_id))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(value.as_deref().and_then(parse_route))
    }

    /// Batch route lookup via MGET. Absent users are simply missing from
    /// the result; a Redis failure surfaces so callers can fall back to
    /// per-user delivery.
    pub async fn routes_of(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, RouteInfo>, StorageError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let handle = self.redis_handle();
        let mut conn = handle.lock().await;
        let mut command = redis::cmd("MGET");
        for user_id in user_ids {
            command.arg(route_key(*user_id));
        }
        let values: Vec<Option<String>> = command
            .query_async::<Vec<Option<String>>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(user_ids
            .iter()
            .zip(values)
            .filter_map(|(user_id, value)| {
                value
                    .as_deref()
                    .and_then(parse_route)
                    .map(|route| (*user_id, route))
            })
            .collect())
    }
}
