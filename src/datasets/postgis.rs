use std::future::Future;
use std::sync::LazyLock;

use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Connection, Row};

use super::graph::TrailGraph;
use super::traits::{ExportMetadata, GraphLoader, LoadedGraph};
use crate::error::{Error, Result};

/// Features per node, in column order.
pub const NODE_FEATURES: [&str; 5] = ["x", "y", "z", "degree", "avg_incident_edge_length"];

/// Connection settings for the trail database.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
}
impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5432,
            database: "trail_master_db".to_owned(),
            user: "postgres".to_owned(),
            password: String::new(),
        }
    }
}
impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}
impl DatabaseConfig {
    fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);
        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }
}

/// Table layout produced by pgRouting's noding step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgisTables {
    pub vertices_table: String,
    pub edges_table: String,
    pub length_column: String,
}
impl Default for PostgisTables {
    fn default() -> Self {
        Self {
            vertices_table: "ways_noded_vertices_pgr".to_owned(),
            edges_table: "ways_noded".to_owned(),
            length_column: "length_km".to_owned(),
        }
    }
}

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("valid regex"));

/// Schema and table names are spliced into SQL text, so only plain
/// identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<&str> {
    if IDENTIFIER.is_match(name) {
        Ok(name)
    } else {
        Err(Error::Config(format!("`{name}` is not a valid SQL identifier")))
    }
}

/// Runs one database interaction to completion on a throwaway
/// current-thread runtime.
pub(crate) fn block_on<F, T>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?
        .block_on(future)
}

/// Opens a connection, hands it to `op`, and closes it whatever `op` returns.
pub(crate) async fn with_connection<T, F>(db: &DatabaseConfig, op: F) -> Result<T>
where
    F: for<'c> FnOnce(
        &'c mut PgConnection,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<T>> + 'c>>,
{
    let mut conn = PgConnection::connect_with(&db.connect_options())
        .await
        .map_err(|source| Error::Connection {
            context: "connect",
            source,
        })?;
    tracing::debug!(host = %db.host, database = %db.database, "connected");
    let result = op(&mut conn).await;
    if let Err(error) = conn.close().await {
        tracing::warn!(%error, "failed to close database connection");
    } else {
        tracing::debug!("disconnected");
    }
    result
}

struct NodeRow {
    id: i64,
    /// Incident edges as counted by the database, dangling ones included.
    degree: usize,
    features: [f32; 5],
}
impl NodeRow {
    fn decode(row: &PgRow) -> std::result::Result<Self, sqlx::Error> {
        let mut features = [0.0f32; 5];
        for (slot, column) in features.iter_mut().zip(["x", "y", "z"]) {
            *slot = row.try_get::<f64, _>(column)? as f32;
        }
        let degree = row.try_get::<i64, _>("degree")?.max(0) as usize;
        features[3] = degree as f32;
        features[4] = row.try_get::<f64, _>("avg_incident_edge_length")? as f32;
        Ok(Self {
            id: row.try_get("id")?,
            degree,
            features,
        })
    }
}

/// Loads the noded trail graph of one schema straight from PostGIS.
#[derive(Clone, Debug)]
pub struct PostgisLoader {
    database: DatabaseConfig,
    tables: PostgisTables,
    schema: String,
}
impl PostgisLoader {
    pub fn new(database: DatabaseConfig, tables: PostgisTables, schema: impl Into<String>) -> Self {
        Self {
            database,
            tables,
            schema: schema.into(),
        }
    }

    fn node_query(&self) -> Result<String> {
        let schema = validate_identifier(&self.schema)?;
        let vertices = validate_identifier(&self.tables.vertices_table)?;
        let edges = validate_identifier(&self.tables.edges_table)?;
        let length = validate_identifier(&self.tables.length_column)?;
        Ok(format!(
            r"
            WITH node_stats AS (
                SELECT
                    v.id::bigint AS id,
                    ST_X(v.the_geom)::float8 AS x,
                    ST_Y(v.the_geom)::float8 AS y,
                    COALESCE(ST_Z(v.the_geom), 0)::float8 AS z,
                    COUNT(e.id)::bigint AS degree,
                    AVG(COALESCE(e.{length}, 0.1))::float8 AS avg_incident_edge_length
                FROM {schema}.{vertices} v
                LEFT JOIN {schema}.{edges} e
                    ON (e.source = v.id OR e.target = v.id)
                GROUP BY v.id, v.the_geom
            )
            SELECT id, x, y, z, degree,
                   COALESCE(avg_incident_edge_length, 0.1) AS avg_incident_edge_length
            FROM node_stats
            ORDER BY id
            "
        ))
    }

    fn edge_query(&self) -> Result<String> {
        let schema = validate_identifier(&self.schema)?;
        let edges = validate_identifier(&self.tables.edges_table)?;
        Ok(format!(
            r"
            SELECT source::bigint AS source, target::bigint AS target
            FROM {schema}.{edges}
            WHERE source IS NOT NULL AND target IS NOT NULL
            ORDER BY source, target
            "
        ))
    }

    async fn fetch(
        conn: &mut PgConnection,
        node_sql: String,
        edge_sql: String,
    ) -> Result<(Vec<NodeRow>, Vec<(i64, i64)>)> {
        let query_error = |source| Error::Connection {
            context: "query",
            source,
        };
        let decode_error = |e: sqlx::Error| Error::data_format(format!("undecodable row: {e}"));

        let nodes = sqlx::query(&node_sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?
            .iter()
            .map(NodeRow::decode)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(decode_error)?;
        tracing::info!(nodes = nodes.len(), "loaded node features");

        let edges = sqlx::query(&edge_sql)
            .fetch_all(&mut *conn)
            .await
            .map_err(query_error)?
            .iter()
            .map(|row| Ok((row.try_get::<i64, _>("source")?, row.try_get::<i64, _>("target")?)))
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(decode_error)?;
        tracing::info!(edges = edges.len(), "loaded edge endpoints");

        Ok((nodes, edges))
    }
}

impl GraphLoader for PostgisLoader {
    fn describe(&self) -> String {
        format!(
            "postgis {}@{}:{}/{} schema {}",
            self.database.user,
            self.database.host,
            self.database.port,
            self.database.database,
            self.schema
        )
    }

    fn load(&self) -> Result<LoadedGraph> {
        let node_sql = self.node_query()?;
        let edge_sql = self.edge_query()?;
        let (nodes, raw_edges) = block_on(with_connection(&self.database, move |conn| {
            Box::pin(Self::fetch(conn, node_sql, edge_sql))
        }))?;
        if nodes.is_empty() {
            return Err(Error::data_format(format!(
                "schema {} has no vertices",
                self.schema
            )));
        }
        assemble(nodes, &raw_edges)
    }
}

/// Builds the graph from fetched rows. Labels later derive from the queried
/// degree column, so the degree feature and the label always agree.
fn assemble(nodes: Vec<NodeRow>, raw_edges: &[(i64, i64)]) -> Result<LoadedGraph> {
    let node_ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
    let features: Vec<f32> = nodes.iter().flat_map(|n| n.features).collect();
    let degrees: Vec<usize> = nodes.iter().map(|n| n.degree).collect();

    let edges = index_edges(&node_ids, raw_edges)
        .map_err(|e| Error::data_format(format!("failed to index edges: {e}")))?;
    let dropped = raw_edges.len() - edges.len();
    if dropped > 0 {
        tracing::warn!(dropped, "skipped edges whose endpoints are not vertices");
    }
    if edges.is_empty() {
        return Err(Error::GraphIntegrity {
            node_count: node_ids.len(),
            dropped,
        });
    }

    let graph = TrailGraph::new(node_ids, features, NODE_FEATURES.len(), edges)?
        .with_source_degrees(degrees)?;
    Ok(LoadedGraph {
        metadata: ExportMetadata {
            num_nodes: Some(graph.num_nodes()),
            num_edges: Some(graph.num_edges()),
            num_features: Some(graph.num_features()),
            num_classes: None,
        },
        graph,
        labels: None,
        partition: None,
        dropped_edges: dropped,
    })
}

/// Maps external endpoint ids to dense row indices; edges touching an unknown
/// id disappear in the inner joins.
pub fn index_edges(node_ids: &[i64], edges: &[(i64, i64)]) -> PolarsResult<Vec<(u32, u32)>> {
    let index = df! { "id" => node_ids.to_vec() }?.with_row_count("__index", None)?;
    let edge_df = df! {
        "source" => edges.iter().map(|&(s, _)| s).collect::<Vec<_>>(),
        "target" => edges.iter().map(|&(_, t)| t).collect::<Vec<_>>(),
    }?;
    let edge_df = edge_df
        .inner_join(&index, ["source"], ["id"])?
        .inner_join(&index, ["target"], ["id"])?;
    let sources = edge_df["__index"].u32()?;
    let targets = edge_df["__index_right"].u32()?;
    Ok(sources
        .into_no_null_iter()
        .zip(targets.into_no_null_iter())
        .collect())
}
