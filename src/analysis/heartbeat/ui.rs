use std::sync::Arc;

use serde::Serialize;

use crate::analysis::SpanType;
use crate::storage::{Filter, RowQuery, Storage, Value};

use super::{APPLICATION_ID, HEARTBEAT_TIME, SCHEMA, SERVICE_ID, SERVICE_NAME, SRC_SPAN_TYPE};

/// A live entry service as shown by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub id: i32,
    pub name: String,
    pub application_id: i32,
}

/// Read path over the `service_name` table.
///
/// Backend failures are logged and reported as an empty result.
pub struct ServiceNameUiDao {
    storage: Arc<Storage>,
}

impl ServiceNameUiDao {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Entry services with a heartbeat at or after `start_time_millis`.
    pub async fn count(&self, start_time_millis: i64) -> usize {
        let query = RowQuery::new(SCHEMA)
            .filter(entry_span())
            .time_range(HEARTBEAT_TIME, start_time_millis, None);

        match self.storage.query(&query).await {
            Ok(rows) => rows.len(),
            Err(e) => {
                tracing::error!(table = SCHEMA.table, error = %e, "service count failed");
                0
            }
        }
    }

    /// Entry services of one application whose name contains `keyword`.
    pub async fn search_service(
        &self,
        keyword: &str,
        application_id: i32,
        start_time_millis: i64,
        top_n: usize,
    ) -> Vec<ServiceInfo> {
        let query = RowQuery::new(SCHEMA)
            .filter(Filter::Contains(SERVICE_NAME, keyword.to_string()))
            .filter(entry_span())
            .filter(Filter::Eq(APPLICATION_ID, Value::Int(application_id.into())))
            .time_range(HEARTBEAT_TIME, start_time_millis, None)
            .limit(top_n);

        let rows = match self.storage.query(&query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(table = SCHEMA.table, keyword, error = %e, "service search failed");
                return Vec::new();
            }
        };

        rows.iter()
            .filter_map(|row| {
                Some(ServiceInfo {
                    id: i32::try_from(row.get_i64(SERVICE_ID)?).ok()?,
                    name: row.get_str(SERVICE_NAME)?.to_string(),
                    application_id: i32::try_from(row.get_i64(APPLICATION_ID)?).ok()?,
                })
            })
            .collect()
    }
}

fn entry_span() -> Filter {
    Filter::Eq(SRC_SPAN_TYPE, Value::Int(SpanType::Entry.value().into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::heartbeat::ServiceName;
    use crate::data::PersistenceData;
    use crate::storage::MemoryStorage;

    fn beat(id: i32, name: &str, app: i32, span: SpanType, time: i64) -> ServiceName {
        ServiceName {
            service_id: id,
            service_name: name.to_string(),
            application_id: app,
            src_span_type: span.value(),
            heartbeat_time: time,
        }
    }

    fn seeded() -> ServiceNameUiDao {
        let memory = Arc::new(MemoryStorage::new());
        for record in [
            beat(1, "/orders", 7, SpanType::Entry, 1_000),
            beat(2, "/orders/{id}", 7, SpanType::Entry, 2_000),
            beat(3, "/orders-db", 7, SpanType::Exit, 2_000),
            beat(4, "/orders", 8, SpanType::Entry, 2_000),
            beat(5, "/users", 7, SpanType::Entry, 500),
        ] {
            memory
                .upsert(ServiceName::TABLE, &record.to_row())
                .expect("upsert");
        }
        ServiceNameUiDao::new(Arc::new(Storage::Memory(memory)))
    }

    #[tokio::test]
    async fn test_count_entry_services_since() {
        let dao = seeded();
        assert_eq!(dao.count(0).await, 4);
        assert_eq!(dao.count(1_500).await, 2);
        assert_eq!(dao.count(10_000).await, 0);
    }

    #[tokio::test]
    async fn test_search_filters_keyword_application_and_time() {
        let dao = seeded();

        let found = dao.search_service("orders", 7, 0, 10).await;
        assert_eq!(
            found,
            vec![
                ServiceInfo {
                    id: 1,
                    name: "/orders".to_string(),
                    application_id: 7,
                },
                ServiceInfo {
                    id: 2,
                    name: "/orders/{id}".to_string(),
                    application_id: 7,
                },
            ]
        );

        assert_eq!(dao.search_service("orders", 7, 1_500, 10).await.len(), 1);
        assert_eq!(dao.search_service("orders", 7, 0, 1).await.len(), 1);
        assert!(dao.search_service("users", 8, 0, 10).await.is_empty());
    }
}
