//! Port allocation.
//!
//! The `UNIQUE (server_id, port, protocol)` constraint is the allocator's
//! lock: an allocation is a single conditional insert, so two concurrent
//! claims on the same triple cannot both succeed.

use manman_events::{PortBinding, Protocol};
use manman_id::{ServerId, SgcId};
use sqlx::{postgres::PgPool, PgConnection, Postgres, Transaction};

use crate::{DbError, ServerPort};

const PORT_COLUMNS: &str = "id, server_id, port, protocol, sgc_id, allocated_at";

/// Upper bound on ports returned by one range scan.
pub const MAX_RANGE_RESULTS: u32 = 1024;

/// Host ports handed out to bindings that do not pin one.
pub const AUTO_PORT_RANGE: (u16, u16) = (27000, 27999);

/// Free ports tried per unpinned binding before giving up.
const AUTO_ASSIGN_CANDIDATES: u32 = 16;

#[derive(Clone)]
pub struct PortRepository {
    pool: PgPool,
}

impl PortRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Allocates one port to an SGC, failing with [`DbError::PortConflict`]
    /// if the triple is taken.
    pub async fn allocate_port(
        &self,
        server_id: ServerId,
        port: u16,
        protocol: Protocol,
        sgc_id: SgcId,
    ) -> Result<ServerPort, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let allocated = insert_port(&mut tx, server_id, port, protocol, sgc_id).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(allocated)
    }

    /// Allocates several ports to one SGC; either all are allocated or none.
    pub async fn allocate_multiple_ports(
        &self,
        server_id: ServerId,
        sgc_id: SgcId,
        ports: &[(u16, Protocol)],
    ) -> Result<Vec<ServerPort>, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let allocated = allocate_in_tx(&mut tx, server_id, sgc_id, ports).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(allocated)
    }

    pub async fn deallocate_port(
        &self,
        server_id: ServerId,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool, DbError> {
        let result = sqlx::query(
            "DELETE FROM server_ports WHERE server_id = $1 AND port = $2 AND protocol = $3",
        )
        .bind(server_id.get())
        .bind(i32::from(port))
        .bind(protocol.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    /// Releases every port held by an SGC. Returns the number released.
    pub async fn deallocate_ports_by_sgc(&self, sgc_id: SgcId) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM server_ports WHERE sgc_id = $1")
            .bind(sgc_id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    pub async fn is_port_available(
        &self,
        server_id: ServerId,
        port: u16,
        protocol: Protocol,
    ) -> Result<bool, DbError> {
        let taken: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM server_ports
                WHERE server_id = $1 AND port = $2 AND protocol = $3
            )
            "#,
        )
        .bind(server_id.get())
        .bind(i32::from(port))
        .bind(protocol.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(!taken)
    }

    /// Returns up to `limit` free ports in `start..=end`, lowest first.
    /// Port 0 is never returned; a range starting there starts at 1.
    ///
    /// The result is a snapshot; callers still have to allocate, and may lose
    /// the race to another allocation.
    pub async fn get_available_ports_in_range(
        &self,
        server_id: ServerId,
        protocol: Protocol,
        start: u16,
        end: u16,
        limit: u32,
    ) -> Result<Vec<u16>, DbError> {
        let mut conn = self.pool.acquire().await.map_err(DbError::Query)?;
        available_in_range(&mut conn, server_id, protocol, start, end, limit).await
    }

    pub async fn list_by_server(&self, server_id: ServerId) -> Result<Vec<ServerPort>, DbError> {
        sqlx::query_as::<_, ServerPort>(&format!(
            "SELECT {PORT_COLUMNS} FROM server_ports WHERE server_id = $1 ORDER BY port, protocol"
        ))
        .bind(server_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }

    pub async fn list_by_sgc(&self, sgc_id: SgcId) -> Result<Vec<ServerPort>, DbError> {
        sqlx::query_as::<_, ServerPort>(&format!(
            "SELECT {PORT_COLUMNS} FROM server_ports WHERE sgc_id = $1 ORDER BY port, protocol"
        ))
        .bind(sgc_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

async fn available_in_range(
    conn: &mut PgConnection,
    server_id: ServerId,
    protocol: Protocol,
    start: u16,
    end: u16,
    limit: u32,
) -> Result<Vec<u16>, DbError> {
    let start = start.max(1);
    if start > end || limit == 0 {
        return Ok(Vec::new());
    }

    let ports: Vec<i32> = sqlx::query_scalar(
        r#"
        SELECT p
        FROM generate_series($2::int, $3::int) AS p
        WHERE NOT EXISTS (
            SELECT 1 FROM server_ports sp
            WHERE sp.server_id = $1 AND sp.protocol = $4 AND sp.port = p
        )
        ORDER BY p
        LIMIT $5
        "#,
    )
    .bind(server_id.get())
    .bind(i32::from(start))
    .bind(i32::from(end))
    .bind(protocol.as_str())
    .bind(i64::from(limit.min(MAX_RANGE_RESULTS)))
    .fetch_all(conn)
    .await
    .map_err(DbError::Query)?;

    Ok(ports
        .into_iter()
        .filter_map(|p| u16::try_from(p).ok())
        .collect())
}

async fn insert_port(
    tx: &mut Transaction<'_, Postgres>,
    server_id: ServerId,
    port: u16,
    protocol: Protocol,
    sgc_id: SgcId,
) -> Result<ServerPort, DbError> {
    let row = sqlx::query_as::<_, ServerPort>(&format!(
        r#"
        INSERT INTO server_ports (server_id, port, protocol, sgc_id)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (server_id, port, protocol) DO NOTHING
        RETURNING {PORT_COLUMNS}
        "#
    ))
    .bind(server_id.get())
    .bind(i32::from(port))
    .bind(protocol.as_str())
    .bind(sgc_id.get())
    .fetch_optional(&mut **tx)
    .await
    .map_err(DbError::from_query)?;

    row.ok_or_else(|| DbError::PortConflict {
        server_id: server_id.get(),
        port,
        protocol: protocol.to_string(),
    })
}

/// Allocates `ports` inside an open transaction. Any conflict aborts the
/// whole batch once the caller drops the transaction.
async fn allocate_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    server_id: ServerId,
    sgc_id: SgcId,
    ports: &[(u16, Protocol)],
) -> Result<Vec<ServerPort>, DbError> {
    let mut allocated = Vec::with_capacity(ports.len());
    for (port, protocol) in ports {
        allocated.push(insert_port(tx, server_id, *port, *protocol, sgc_id).await?);
    }
    Ok(allocated)
}

/// Allocates the host side of `bindings` inside an open transaction and
/// returns them with every unpinned (`host_port == 0`) binding resolved to a
/// free port from [`AUTO_PORT_RANGE`].
///
/// Pinned ports are claimed first so an assigned port never takes one that
/// a later binding asked for explicitly.
pub(crate) async fn allocate_bindings(
    tx: &mut Transaction<'_, Postgres>,
    server_id: ServerId,
    sgc_id: SgcId,
    bindings: &[PortBinding],
) -> Result<Vec<PortBinding>, DbError> {
    for binding in bindings.iter().filter(|b| !b.is_unpinned()) {
        insert_port(tx, server_id, binding.host_port, binding.protocol, sgc_id).await?;
    }

    let mut resolved = bindings.to_vec();
    for binding in resolved.iter_mut().filter(|b| b.is_unpinned()) {
        let port = claim_free_port(tx, server_id, binding.protocol, sgc_id).await?;
        binding.host_port = port.port;
    }
    Ok(resolved)
}

async fn claim_free_port(
    tx: &mut Transaction<'_, Postgres>,
    server_id: ServerId,
    protocol: Protocol,
    sgc_id: SgcId,
) -> Result<ServerPort, DbError> {
    let (start, end) = AUTO_PORT_RANGE;
    let candidates = available_in_range(
        &mut **tx,
        server_id,
        protocol,
        start,
        end,
        AUTO_ASSIGN_CANDIDATES,
    )
    .await?;

    // A candidate claimed by a concurrent transaction conflicts without
    // aborting this one.
    for port in candidates {
        match insert_port(tx, server_id, port, protocol, sgc_id).await {
            Ok(allocated) => return Ok(allocated),
            Err(DbError::PortConflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(DbError::Conflict(format!(
        "no free {protocol} port in {start}-{end} on server {server_id}"
    )))
}
