use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde_json::Value;

use super::{
    claim_key, item_index_key, node_key, room_key, Applied, Departure, Discarded, FocusOutcome,
    JoinedRoom, NewParticipant, Participant, RoomSnapshot, RoomStateStore, StoreError,
    StoreResult, ROOMS_KEY, SETTINGS_KEY,
};
use crate::protocol::{Changes, Focuses};
use crate::room::{RoomId, RoomMeta};

const META: &str = "meta";
const CHANGES: &str = "changes";
const FOCUSES: &str = "focuses";
const CLIENTS: &str = "clients";
const SEQ: &str = "seq";
const REV: &str = "rev";

/// KEYS: meta, changes, focuses, clients, seq, rev, rooms set, item index.
/// ARGV: meta json, room id, connection, user, node, colour count, colours..., change pairs...
const JOIN_LUA: &str = r#"
local ncolors = tonumber(ARGV[6])
local created = 0
if redis.call('EXISTS', KEYS[1]) == 0 then
  created = 1
  redis.call('DEL', KEYS[2], KEYS[3], KEYS[4])
  redis.call('SET', KEYS[1], ARGV[1])
  redis.call('SET', KEYS[5], 0)
  redis.call('SET', KEYS[6], 0)
  for i = 7 + ncolors, #ARGV, 2 do
    redis.call('HSET', KEYS[2], ARGV[i], ARGV[i + 1])
  end
end
redis.call('SADD', KEYS[7], ARGV[2])
redis.call('SADD', KEYS[8], ARGV[2])
for i = 1, 6 do
  redis.call('PERSIST', KEYS[i])
end
local existing = redis.call('HGET', KEYS[4], ARGV[3])
if existing then
  return {tostring(created), '0', existing, redis.call('GET', KEYS[6]) or '0'}
end
local taken = {}
for _, raw in ipairs(redis.call('HVALS', KEYS[4])) do
  taken[cjson.decode(raw).color] = true
end
local color = ARGV[7] or ''
for i = 7, 6 + ncolors do
  if not taken[ARGV[i]] then
    color = ARGV[i]
    break
  end
end
local participant = cjson.encode({connection = ARGV[3], user = ARGV[4], color = color, node = ARGV[5]})
redis.call('HSET', KEYS[4], ARGV[3], participant)
return {tostring(created), '1', participant, tostring(redis.call('INCR', KEYS[6]))}
"#;

/// KEYS: meta, changes, focuses, clients, seq, rev. ARGV: connection, idle ttl in ms.
/// Replies `{remaining, revision}`, or a single negative code.
const LEAVE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-2}
end
if redis.call('HDEL', KEYS[4], ARGV[1]) == 0 then
  return {-1}
end
redis.call('HDEL', KEYS[3], ARGV[1])
local revision = redis.call('INCR', KEYS[6])
local remaining = redis.call('HLEN', KEYS[4])
if remaining == 0 then
  for i = 1, 6 do
    redis.call('PEXPIRE', KEYS[i], ARGV[2])
  end
end
return {remaining, revision}
"#;

/// KEYS: meta, clients, focuses, rev. ARGV: connection, field (absent to release).
const FOCUS_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'missing'}
end
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 0 then
  return {'stranger'}
end
local previous = redis.call('HGET', KEYS[3], ARGV[1])
if #ARGV < 2 then
  if not previous then
    return {'unchanged'}
  end
  redis.call('HDEL', KEYS[3], ARGV[1])
  return {'released', tostring(redis.call('INCR', KEYS[4])), previous}
end
if previous == ARGV[2] then
  return {'unchanged'}
end
local all = redis.call('HGETALL', KEYS[3])
for i = 1, #all, 2 do
  if all[i + 1] == ARGV[2] and all[i] ~= ARGV[1] then
    return {'conflict', all[i]}
  end
end
redis.call('HSET', KEYS[3], ARGV[1], ARGV[2])
local revision = tostring(redis.call('INCR', KEYS[4]))
if previous then
  return {'focused', revision, previous}
end
return {'focused', revision}
"#;

/// KEYS: meta, clients, focuses, changes, seq, rev. ARGV: connection, field, value json.
/// Replies `{order, revision}`, or a single negative code.
const UPDATE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {-2}
end
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 0 then
  return {-1}
end
local all = redis.call('HGETALL', KEYS[3])
for i = 1, #all, 2 do
  if all[i + 1] == ARGV[2] and all[i] ~= ARGV[1] then
    return {-3}
  end
end
redis.call('HSET', KEYS[4], ARGV[2], ARGV[3])
local order = redis.call('INCR', KEYS[5])
return {order, redis.call('INCR', KEYS[6])}
"#;

/// KEYS: meta, clients, changes, rev, focuses. ARGV: connection, '1' to refuse fields
/// focused by someone else, fields...
const DISCARD_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'missing'}
end
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 0 then
  return {'stranger'}
end
local fields = {}
for i = 3, #ARGV do
  if ARGV[i] == '*' then
    fields = redis.call('HKEYS', KEYS[3])
    break
  end
  fields[#fields + 1] = ARGV[i]
end
if ARGV[2] == '1' then
  local all = redis.call('HGETALL', KEYS[5])
  for i = 1, #all, 2 do
    for _, field in ipairs(fields) do
      if all[i + 1] == field and all[i] ~= ARGV[1] then
        return {'conflict', field}
      end
    end
  end
end
local removed = {}
for _, field in ipairs(fields) do
  if redis.call('HDEL', KEYS[3], field) == 1 then
    removed[#removed + 1] = field
  end
end
local revision
if #removed > 0 then
  revision = tostring(redis.call('INCR', KEYS[4]))
else
  revision = redis.call('GET', KEYS[4]) or '0'
end
local reply = {'ok', revision}
for _, field in ipairs(removed) do
  reply[#reply + 1] = field
end
return reply
"#;

/// KEYS: meta, changes, rev. ARGV: field, expected raw value pairs.
const PRUNE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {'missing'}
end
local cleared = {}
for i = 1, #ARGV, 2 do
  if redis.call('HGET', KEYS[2], ARGV[i]) == ARGV[i + 1] then
    redis.call('HDEL', KEYS[2], ARGV[i])
    cleared[#cleared + 1] = ARGV[i]
  end
end
local reply = {'ok', tostring(redis.call('INCR', KEYS[3]))}
for _, field in ipairs(cleared) do
  reply[#reply + 1] = field
end
return reply
"#;

struct Scripts {
    join: Script,
    leave: Script,
    focus: Script,
    update: Script,
    discard: Script,
    prune: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            join: Script::new(JOIN_LUA),
            leave: Script::new(LEAVE_LUA),
            focus: Script::new(FOCUS_LUA),
            update: Script::new(UPDATE_LUA),
            discard: Script::new(DISCARD_LUA),
            prune: Script::new(PRUNE_LUA),
        }
    }
}

/// Redis-backed store shared by every node of a deployment.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            scripts: Arc::new(Scripts::load()),
        })
    }

    fn keys(room: &str) -> [String; 6] {
        [
            room_key(room, META),
            room_key(room, CHANGES),
            room_key(room, FOCUSES),
            room_key(room, CLIENTS),
            room_key(room, SEQ),
            room_key(room, REV),
        ]
    }

    async fn remove_fields(
        &self,
        room: &str,
        connection: &str,
        respect_focus: bool,
        fields: &[String],
    ) -> StoreResult<Discarded> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.discard.prepare_invoke();
        invocation
            .key(room_key(room, META))
            .key(room_key(room, CLIENTS))
            .key(room_key(room, CHANGES))
            .key(room_key(room, REV))
            .key(room_key(room, FOCUSES))
            .arg(connection)
            .arg(if respect_focus { "1" } else { "0" });
        for field in fields {
            invocation.arg(field);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [status, field] if status == "conflict" => Err(StoreError::FieldLocked(field.clone())),
            [status, revision, fields @ ..] if status == "ok" => Ok(Discarded {
                fields: fields.to_vec(),
                revision: parse_revision(revision)?,
            }),
            [status, ..] => Err(status_error(room, status)),
            [] => Err(StoreError::Corrupt("empty discard reply".into())),
        }
    }

    /// Metas for `ids`, forgetting ids whose room has expired from `index`.
    async fn load_metas(&self, index: &str, ids: Vec<RoomId>) -> StoreResult<Vec<RoomMeta>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let keys: Vec<String> = ids.iter().map(|room| room_key(room, META)).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;

        let mut metas = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for (room, value) in ids.into_iter().zip(values) {
            match value {
                Some(raw) => metas.push(serde_json::from_str(&raw)?),
                None => stale.push(room),
            }
        }
        if !stale.is_empty() {
            let _: () = conn.srem(index, stale).await?;
        }
        Ok(metas)
    }
}

fn parse_changes(raw: HashMap<String, String>) -> StoreResult<Changes> {
    raw.into_iter()
        .map(|(field, value)| -> StoreResult<(String, Value)> {
            Ok((field, serde_json::from_str(&value)?))
        })
        .collect()
}

fn status_error(room: &str, status: &str) -> StoreError {
    match status {
        "missing" => StoreError::RoomNotFound(room.to_string()),
        "stranger" => StoreError::NotParticipant(room.to_string()),
        other => StoreError::Corrupt(format!("unexpected script status {other}")),
    }
}

fn parse_revision(raw: &str) -> StoreResult<u64> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("bad revision {raw}")))
}

fn code_error(room: &str, field: &str, code: i64) -> StoreError {
    match code {
        -1 => StoreError::NotParticipant(room.to_string()),
        -2 => StoreError::RoomNotFound(room.to_string()),
        -3 => StoreError::FieldLocked(field.to_string()),
        other => StoreError::Corrupt(format!("unexpected script result {other}")),
    }
}

#[async_trait]
impl RoomStateStore for RedisStore {
    async fn join_room(
        &self,
        meta: &RoomMeta,
        participant: NewParticipant<'_>,
        initial_changes: &Changes,
    ) -> StoreResult<JoinedRoom> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.join.prepare_invoke();
        for key in Self::keys(&meta.room) {
            invocation.key(key);
        }
        invocation
            .key(ROOMS_KEY)
            .key(item_index_key(&meta.key.collection, meta.key.item.as_deref()))
            .arg(serde_json::to_string(meta)?)
            .arg(&meta.room)
            .arg(participant.connection)
            .arg(participant.user)
            .arg(participant.node)
            .arg(participant.colors.len());
        for color in participant.colors {
            invocation.arg(color);
        }
        for (field, value) in initial_changes {
            invocation.arg(field).arg(serde_json::to_string(value)?);
        }

        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [created, added, raw, revision] => Ok(JoinedRoom {
                created: created == "1",
                added: added == "1",
                participant: serde_json::from_str(raw)?,
                revision: parse_revision(revision)?,
            }),
            _ => Err(StoreError::Corrupt("malformed join reply".into())),
        }
    }

    async fn room_meta(&self, room: &str) -> StoreResult<Option<RoomMeta>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(room_key(room, META)).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn snapshot(&self, room: &str) -> StoreResult<Option<RoomSnapshot>> {
        let mut conn = self.redis.clone();
        let [meta, changes, focuses, clients, seq, rev] = Self::keys(room);
        let (meta, changes, focuses, clients, seq, rev): (
            Option<String>,
            HashMap<String, String>,
            HashMap<String, String>,
            HashMap<String, String>,
            Option<u64>,
            Option<u64>,
        ) = redis::pipe()
            .atomic()
            .get(meta)
            .hgetall(changes)
            .hgetall(focuses)
            .hgetall(clients)
            .get(seq)
            .get(rev)
            .query_async(&mut conn)
            .await?;

        let Some(meta) = meta else {
            return Ok(None);
        };
        let mut participants = clients
            .values()
            .map(|raw| serde_json::from_str::<Participant>(raw))
            .collect::<Result<Vec<_>, _>>()?;
        participants.sort_by(|a, b| a.connection.cmp(&b.connection));

        Ok(Some(RoomSnapshot {
            meta: serde_json::from_str(&meta)?,
            changes: parse_changes(changes)?,
            focuses: focuses.into_iter().collect::<Focuses>(),
            participants,
            order: seq.unwrap_or(0),
            revision: rev.unwrap_or(0),
        }))
    }

    async fn participants(&self, room: &str) -> StoreResult<Vec<Participant>> {
        let mut conn = self.redis.clone();
        let raw: Vec<String> = conn.hvals(room_key(room, CLIENTS)).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StoreError::from))
            .collect()
    }

    async fn remove_participant(
        &self,
        room: &str,
        connection: &str,
        idle_ttl: Duration,
    ) -> StoreResult<Option<Departure>> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.leave.prepare_invoke();
        for key in Self::keys(room) {
            invocation.key(key);
        }
        let reply: Vec<i64> = invocation
            .arg(connection)
            .arg(idle_ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_slice() {
            [-1] => Ok(None),
            &[remaining, revision] if remaining >= 0 && revision > 0 => Ok(Some(Departure {
                remaining: remaining as usize,
                revision: revision as u64,
            })),
            &[code, ..] => Err(code_error(room, "", code)),
            [] => Err(StoreError::Corrupt("empty leave reply".into())),
        }
    }

    async fn set_focus(
        &self,
        room: &str,
        connection: &str,
        field: Option<&str>,
    ) -> StoreResult<FocusOutcome> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.focus.prepare_invoke();
        invocation
            .key(room_key(room, META))
            .key(room_key(room, CLIENTS))
            .key(room_key(room, FOCUSES))
            .key(room_key(room, REV))
            .arg(connection);
        if let Some(field) = field {
            invocation.arg(field);
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [status] if status == "unchanged" => Ok(FocusOutcome::Unchanged),
            [status, revision] if status == "focused" => Ok(FocusOutcome::Focused {
                previous: None,
                revision: parse_revision(revision)?,
            }),
            [status, revision, previous] if status == "focused" => Ok(FocusOutcome::Focused {
                previous: Some(previous.clone()),
                revision: parse_revision(revision)?,
            }),
            [status, revision, previous] if status == "released" => Ok(FocusOutcome::Released {
                previous: previous.clone(),
                revision: parse_revision(revision)?,
            }),
            [status, _] if status == "conflict" => {
                Err(StoreError::FieldLocked(field.unwrap_or_default().to_string()))
            }
            [status, ..] => Err(status_error(room, status)),
            [] => Err(StoreError::Corrupt("empty focus reply".into())),
        }
    }

    async fn apply_update(
        &self,
        room: &str,
        connection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Applied> {
        let mut conn = self.redis.clone();
        let mut invocation = self.scripts.update.prepare_invoke();
        let reply: Vec<i64> = invocation
            .key(room_key(room, META))
            .key(room_key(room, CLIENTS))
            .key(room_key(room, FOCUSES))
            .key(room_key(room, CHANGES))
            .key(room_key(room, SEQ))
            .key(room_key(room, REV))
            .arg(connection)
            .arg(field)
            .arg(serde_json::to_string(value)?)
            .invoke_async(&mut conn)
            .await?;
        match reply.as_slice() {
            &[order, revision] if order > 0 && revision > 0 => Ok(Applied {
                order: order as u64,
                revision: revision as u64,
            }),
            &[code, ..] => Err(code_error(room, field, code)),
            [] => Err(StoreError::Corrupt("empty update reply".into())),
        }
    }

    async fn discard(
        &self,
        room: &str,
        connection: &str,
        fields: &[String],
    ) -> StoreResult<Discarded> {
        self.remove_fields(room, connection, false, fields).await
    }

    async fn unset(&self, room: &str, connection: &str, field: &str) -> StoreResult<Discarded> {
        self.remove_fields(room, connection, true, &[field.to_string()])
            .await
    }

    async fn prune_saved(&self, room: &str, saved: &Changes) -> StoreResult<Option<Discarded>> {
        let mut conn = self.redis.clone();
        let changes_key = room_key(room, CHANGES);
        let stored: HashMap<String, String> = conn.hgetall(&changes_key).await?;

        // raw values are compared in the script so a concurrent update is never cleared
        let mut invocation = self.scripts.prune.prepare_invoke();
        invocation
            .key(room_key(room, META))
            .key(&changes_key)
            .key(room_key(room, REV));
        for (field, raw) in &stored {
            let Some(expected) = saved.get(field) else {
                continue;
            };
            if serde_json::from_str::<Value>(raw)? == *expected {
                invocation.arg(field).arg(raw);
            }
        }
        let reply: Vec<String> = invocation.invoke_async(&mut conn).await?;
        match reply.as_slice() {
            [status] if status == "missing" => Ok(None),
            [status, revision, fields @ ..] if status == "ok" => Ok(Some(Discarded {
                fields: fields.to_vec(),
                revision: parse_revision(revision)?,
            })),
            _ => Err(StoreError::Corrupt("malformed prune reply".into())),
        }
    }

    async fn close_room(&self, room: &str) -> StoreResult<bool> {
        let Some(meta) = self.room_meta(room).await? else {
            return Ok(false);
        };
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in Self::keys(room) {
            pipe.del(key).ignore();
        }
        pipe.srem(ROOMS_KEY, room)
            .ignore()
            .srem(
                item_index_key(&meta.key.collection, meta.key.item.as_deref()),
                room,
            )
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }

    async fn rooms(&self) -> StoreResult<Vec<RoomMeta>> {
        let mut conn = self.redis.clone();
        let ids: Vec<RoomId> = conn.smembers(ROOMS_KEY).await?;
        self.load_metas(ROOMS_KEY, ids).await
    }

    async fn rooms_for_item(
        &self,
        collection: &str,
        item: Option<&str>,
    ) -> StoreResult<Vec<RoomMeta>> {
        let mut conn = self.redis.clone();
        let index = item_index_key(collection, item);
        let ids: Vec<RoomId> = conn.smembers(&index).await?;
        self.load_metas(&index, ids).await
    }

    async fn claim(&self, key: &str, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(claim_key(key))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn heartbeat(&self, node: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(node_key(node))
            .arg(chrono::Utc::now().timestamp_millis())
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn live_nodes(&self, nodes: &[String]) -> StoreResult<HashSet<String>> {
        if nodes.is_empty() {
            return Ok(HashSet::new());
        }
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for node in nodes {
            pipe.exists(node_key(node));
        }
        let alive: Vec<bool> = pipe.query_async(&mut conn).await?;
        Ok(nodes
            .iter()
            .zip(alive)
            .filter(|(_, alive)| *alive)
            .map(|(node, _)| node.clone())
            .collect())
    }

    async fn collab_enabled(&self) -> StoreResult<Option<bool>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.hget(SETTINGS_KEY, "enabled").await?;
        Ok(raw.map(|raw| raw == "1"))
    }

    async fn set_collab_enabled(&self, enabled: bool) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let flag = if enabled { "1" } else { "0" };
        let _: () = conn.hset(SETTINGS_KEY, "enabled", flag).await?;
        Ok(())
    }
}
