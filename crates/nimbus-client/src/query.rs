//! Fluent query builder.
//!
//! A [`Query`] accumulates constraints and only touches the network when a
//! terminal (`find`, `first`, `get`, `count`, `each`) is called. Every
//! terminal issues one request per page and hands back a [`Deferred`].

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::geo::{EARTH_RADIUS_KM, EARTH_RADIUS_MILES};
use crate::types::Pointer;
use crate::{Client, Deferred, ErrorCode, GeoPoint, NimbusError, Record, RecordKind, RequestOptions};

/// One constraint as the caller added it.
#[derive(Debug, Clone, PartialEq)]
enum Constraint {
    Equal(Value),
    /// Operators that must live in the same object (`$regex` with `$options`).
    Operators(Map<String, Value>),
}

/// Filter, ordering, projection, and pagination against one class.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    kind: RecordKind,
    constraints: Vec<(String, Constraint)>,
    or_clauses: Option<Vec<Value>>,
    related_to: Option<Value>,
    order: Vec<String>,
    keys: Vec<String>,
    include: Vec<String>,
    limit: Option<usize>,
    skip: usize,
    redirect_key: Option<String>,
}

/// Options for [`Query::each`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EachOptions {
    /// Records per page. The server's default page size applies when unset.
    pub batch_size: Option<usize>,
    pub request: RequestOptions,
}

/// Quote a literal for use inside a regular expression.
fn quote(s: &str) -> String {
    format!("\\Q{}\\E", s.replace("\\E", "\\E\\\\E\\Q"))
}

impl Query {
    pub fn new(kind: impl Into<RecordKind>) -> Self {
        Self {
            kind: kind.into(),
            constraints: Vec::new(),
            or_clauses: None,
            related_to: None,
            order: Vec::new(),
            keys: Vec::new(),
            include: Vec::new(),
            limit: None,
            skip: 0,
            redirect_key: None,
        }
    }

    /// A query matching records that match any of `queries`.
    ///
    /// All queries must target the same class.
    pub fn or(queries: Vec<Query>) -> Result<Query, NimbusError> {
        let Some(first) = queries.first() else {
            return Err(NimbusError::invalid(
                ErrorCode::InvalidQuery,
                "cannot build an OR of zero queries",
            ));
        };
        let kind = first.kind.clone();
        if let Some(other) = queries.iter().find(|q| q.kind != kind) {
            return Err(NimbusError::invalid(
                ErrorCode::InvalidClassName,
                format!(
                    "all queries in an OR must be on the same class ({} vs {})",
                    kind, other.kind
                ),
            ));
        }

        let mut query = Query::new(kind);
        query.or_clauses = Some(queries.iter().map(Query::where_clause).collect());
        Ok(query)
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn class_name(&self) -> &str {
        self.kind.class_name()
    }

    fn add(&mut self, key: &str, constraint: Constraint) -> &mut Self {
        self.constraints.push((key.to_string(), constraint));
        self
    }

    fn add_op(&mut self, key: &str, op: &str, value: impl Into<Value>) -> &mut Self {
        let mut ops = Map::new();
        ops.insert(op.to_string(), value.into());
        self.add(key, Constraint::Operators(ops))
    }

    pub fn equal_to(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.add(key, Constraint::Equal(value.into()))
    }

    pub fn not_equal_to(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.add_op(key, "$ne", value)
    }

    pub fn less_than(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.add_op(key, "$lt", value)
    }

    pub fn less_than_or_equal_to(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.add_op(key, "$lte", value)
    }

    pub fn greater_than(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.add_op(key, "$gt", value)
    }

    pub fn greater_than_or_equal_to(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.add_op(key, "$gte", value)
    }

    pub fn contained_in(&mut self, key: &str, values: Vec<Value>) -> &mut Self {
        self.add_op(key, "$in", values)
    }

    pub fn not_contained_in(&mut self, key: &str, values: Vec<Value>) -> &mut Self {
        self.add_op(key, "$nin", values)
    }

    /// Array field contains every one of `values`.
    pub fn contains_all(&mut self, key: &str, values: Vec<Value>) -> &mut Self {
        self.add_op(key, "$all", values)
    }

    pub fn exists(&mut self, key: &str) -> &mut Self {
        self.add_op(key, "$exists", true)
    }

    pub fn does_not_exist(&mut self, key: &str) -> &mut Self {
        self.add_op(key, "$exists", false)
    }

    /// String field matches a regular expression.
    ///
    /// `modifiers` is passed through as the regex options (`i`, `m`, ...).
    pub fn matches(&mut self, key: &str, regex: &str, modifiers: &str) -> &mut Self {
        let mut ops = Map::new();
        ops.insert("$regex".to_string(), Value::from(regex));
        if !modifiers.is_empty() {
            ops.insert("$options".to_string(), Value::from(modifiers));
        }
        self.add(key, Constraint::Operators(ops))
    }

    pub fn contains(&mut self, key: &str, substring: &str) -> &mut Self {
        self.add_op(key, "$regex", quote(substring))
    }

    pub fn starts_with(&mut self, key: &str, prefix: &str) -> &mut Self {
        self.add_op(key, "$regex", format!("^{}", quote(prefix)))
    }

    pub fn ends_with(&mut self, key: &str, suffix: &str) -> &mut Self {
        self.add_op(key, "$regex", format!("{}$", quote(suffix)))
    }

    /// Sort by distance from `point`, nearest first.
    pub fn near(&mut self, key: &str, point: GeoPoint) -> &mut Self {
        self.add_op(key, "$nearSphere", point)
    }

    pub fn within_radians(&mut self, key: &str, point: GeoPoint, max_distance: f64) -> &mut Self {
        let mut ops = Map::new();
        ops.insert("$nearSphere".to_string(), point.into());
        ops.insert("$maxDistance".to_string(), Value::from(max_distance));
        self.add(key, Constraint::Operators(ops))
    }

    pub fn within_kilometers(&mut self, key: &str, point: GeoPoint, max_distance: f64) -> &mut Self {
        self.within_radians(key, point, max_distance / EARTH_RADIUS_KM)
    }

    pub fn within_miles(&mut self, key: &str, point: GeoPoint, max_distance: f64) -> &mut Self {
        self.within_radians(key, point, max_distance / EARTH_RADIUS_MILES)
    }

    pub fn within_geo_box(&mut self, key: &str, southwest: GeoPoint, northeast: GeoPoint) -> &mut Self {
        self.add_op(
            key,
            "$within",
            json!({ "$box": [Value::from(southwest), Value::from(northeast)] }),
        )
    }

    /// Pointer field points at a record matched by `inner`.
    pub fn matches_query(&mut self, key: &str, inner: &Query) -> &mut Self {
        self.add_op(key, "$inQuery", inner.to_json())
    }

    pub fn does_not_match_query(&mut self, key: &str, inner: &Query) -> &mut Self {
        self.add_op(key, "$notInQuery", inner.to_json())
    }

    /// Field equals `query_key` of some record matched by `inner`.
    pub fn matches_key_in_query(&mut self, key: &str, query_key: &str, inner: &Query) -> &mut Self {
        self.add_op(
            key,
            "$select",
            json!({ "key": query_key, "query": inner.to_json() }),
        )
    }

    pub fn does_not_match_key_in_query(
        &mut self,
        key: &str,
        query_key: &str,
        inner: &Query,
    ) -> &mut Self {
        self.add_op(
            key,
            "$dontSelect",
            json!({ "key": query_key, "query": inner.to_json() }),
        )
    }

    /// Records that are members of `key` on `parent`.
    pub fn related_to(&mut self, parent: Pointer, key: &str) -> &mut Self {
        self.related_to = Some(json!({ "object": Value::from(parent), "key": key }));
        self
    }

    /// Ask the server to answer with the target class of relation `key`.
    pub fn redirect_class_name_for_key(&mut self, key: &str) -> &mut Self {
        self.redirect_key = Some(key.to_string());
        self
    }

    /// Sort ascending by `key`, after any sort keys already added.
    pub fn ascending(&mut self, key: &str) -> &mut Self {
        self.order.push(key.to_string());
        self
    }

    /// Sort descending by `key`, after any sort keys already added.
    pub fn descending(&mut self, key: &str) -> &mut Self {
        self.order.push(format!("-{key}"));
        self
    }

    pub fn clear_order(&mut self) -> &mut Self {
        self.order.clear();
        self
    }

    /// Only return these fields (plus the built-in ones).
    pub fn select<I, S>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Inline the records behind a pointer field (dotted paths allowed).
    pub fn include(&mut self, key: &str) -> &mut Self {
        self.include.push(key.to_string());
        self
    }

    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(&mut self, skip: usize) -> &mut Self {
        self.skip = skip;
        self
    }

    /// The `where` filter this query sends.
    ///
    /// Constraints that would collide inside one object, such as two
    /// equalities on the same field or a repeated operator, are moved into
    /// an `$and` list so that every one reaches the server.
    pub fn where_clause(&self) -> Value {
        enum Slot {
            Equal(Value),
            Operators(Map<String, Value>),
        }

        let mut fields: Vec<(String, Slot)> = Vec::new();
        let mut overflow: Vec<Value> = Vec::new();

        for (key, constraint) in &self.constraints {
            let existing = fields.iter().position(|(k, _)| k == key);
            match (existing, constraint) {
                (None, Constraint::Equal(value)) => {
                    fields.push((key.clone(), Slot::Equal(value.clone())));
                }
                (None, Constraint::Operators(ops)) => {
                    fields.push((key.clone(), Slot::Operators(ops.clone())));
                }
                (Some(index), Constraint::Operators(ops))
                    if matches!(&fields[index].1, Slot::Operators(current)
                        if ops.keys().all(|op| !current.contains_key(op))) =>
                {
                    if let Slot::Operators(current) = &mut fields[index].1 {
                        current.extend(ops.clone());
                    }
                }
                (Some(_), Constraint::Equal(value)) => {
                    overflow.push(json!({ key.clone(): value.clone() }));
                }
                (Some(_), Constraint::Operators(ops)) => {
                    overflow.push(json!({ key.clone(): Value::Object(ops.clone()) }));
                }
            }
        }

        let mut filter = Map::new();
        for (key, slot) in fields {
            let value = match slot {
                Slot::Equal(value) => value,
                Slot::Operators(ops) => Value::Object(ops),
            };
            filter.insert(key, value);
        }
        if let Some(clauses) = &self.or_clauses {
            filter.insert("$or".to_string(), Value::Array(clauses.clone()));
        }
        if let Some(related) = &self.related_to {
            filter.insert("$relatedTo".to_string(), related.clone());
        }
        if !overflow.is_empty() {
            filter.insert("$and".to_string(), Value::Array(overflow));
        }
        Value::Object(filter)
    }

    /// JSON form used when nesting this query inside another.
    pub fn to_json(&self) -> Value {
        let mut json = Map::new();
        json.insert("className".to_string(), Value::from(self.class_name()));
        json.insert("where".to_string(), self.where_clause());
        if let Some(limit) = self.limit {
            json.insert("limit".to_string(), Value::from(limit));
        }
        if self.skip > 0 {
            json.insert("skip".to_string(), Value::from(self.skip));
        }
        if !self.order.is_empty() {
            json.insert("order".to_string(), Value::from(self.order.join(",")));
        }
        if !self.keys.is_empty() {
            json.insert("keys".to_string(), Value::from(self.keys.join(",")));
        }
        if !self.include.is_empty() {
            json.insert("include".to_string(), Value::from(self.include.join(",")));
        }
        Value::Object(json)
    }

    /// URL parameters for a find request.
    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("where".to_string(), self.where_clause().to_string())];
        if !self.order.is_empty() {
            params.push(("order".to_string(), self.order.join(",")));
        }
        if let Some(limit) = self.limit {
            params.push(("limit".to_string(), limit.to_string()));
        }
        if self.skip > 0 {
            params.push(("skip".to_string(), self.skip.to_string()));
        }
        if !self.keys.is_empty() {
            params.push(("keys".to_string(), self.keys.join(",")));
        }
        if !self.include.is_empty() {
            params.push(("include".to_string(), self.include.join(",")));
        }
        if let Some(key) = &self.redirect_key {
            params.push(("redirectClassNameForKey".to_string(), key.clone()));
        }
        params
    }

    /// All matching records, in server order.
    pub fn find(&self, client: &Client, options: RequestOptions) -> Deferred<Vec<Record>> {
        let query = self.clone();
        let client = client.clone();
        Deferred::spawn(async move { client.find_records(&query, &options).await })
    }

    /// The first matching record, if any.
    pub fn first(&self, client: &Client, options: RequestOptions) -> Deferred<Option<Record>> {
        let mut query = self.clone();
        query.limit(1);
        let client = client.clone();
        Deferred::spawn(async move {
            Ok(client
                .find_records(&query, &options)
                .await?
                .into_iter()
                .next())
        })
    }

    /// The matching record with this id. Fails with `OBJECT_NOT_FOUND` when
    /// it does not exist or does not match the other constraints.
    pub fn get(&self, id: &str, client: &Client, options: RequestOptions) -> Deferred<Record> {
        let mut query = self.clone();
        query.equal_to("objectId", id).limit(1);
        let client = client.clone();
        let id = id.to_string();
        Deferred::spawn(async move {
            client
                .find_records(&query, &options)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| NimbusError::Service {
                    code: ErrorCode::ObjectNotFound,
                    message: format!("object {id} not found"),
                })
        })
    }

    /// Number of matching records.
    pub fn count(&self, client: &Client, options: RequestOptions) -> Deferred<u64> {
        let query = self.clone();
        let client = client.clone();
        Deferred::spawn(async move { client.count_records(&query, &options).await })
    }

    /// Call `f` on every matching record, fetching them page by page.
    ///
    /// Pages are ordered by `objectId` and each page starts after the last id
    /// seen. The first failing page rejects the result and stops iteration.
    pub fn each<F>(&self, client: &Client, options: EachOptions, mut f: F) -> Deferred<()>
    where
        F: FnMut(Record) + Send + 'static,
    {
        if !self.order.is_empty() || self.limit.is_some() || self.skip > 0 {
            return Deferred::rejected(NimbusError::invalid(
                ErrorCode::InvalidQuery,
                "cannot iterate a query with sort, skip, or limit",
            ));
        }

        let base = self.clone();
        let client = client.clone();
        Deferred::spawn(async move {
            let mut last_id: Option<String> = None;
            let mut pages = 0usize;
            loop {
                let mut page = base.clone();
                page.ascending("objectId");
                if let Some(size) = options.batch_size {
                    page.limit(size);
                }
                if let Some(id) = &last_id {
                    page.greater_than("objectId", id.as_str());
                }

                let records = client.find_records(&page, &options.request).await?;
                pages += 1;
                let fetched = records.len();
                debug!(class = %base.class_name(), page = pages, fetched, "fetched page");

                if fetched == 0 {
                    break;
                }
                last_id = records
                    .last()
                    .and_then(|r| r.id())
                    .map(str::to_string);
                for record in records {
                    f(record);
                }

                let short = options.batch_size.is_some_and(|size| fetched < size);
                if short || last_id.is_none() {
                    break;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_chaining_mutates_same_builder() {
        let mut query = Query::new("GameScore");
        query.greater_than("score", 1000).equal_to("player", "Sean");
        assert_eq!(
            query.where_clause(),
            json!({"score": {"$gt": 1000}, "player": "Sean"})
        );
    }

    #[test]
    fn test_range_on_one_field_shares_object() {
        let mut query = Query::new("GameScore");
        query.greater_than("score", 10).less_than_or_equal_to("score", 20);
        assert_eq!(
            query.where_clause(),
            json!({"score": {"$gt": 10, "$lte": 20}})
        );
    }

    #[test]
    fn test_conflicting_equality_is_forwarded() {
        let mut query = Query::new("A");
        query.equal_to("x", 1).equal_to("x", 2);
        assert_eq!(
            query.where_clause(),
            json!({"x": 1, "$and": [{"x": 2}]})
        );
    }

    #[test]
    fn test_repeated_operator_goes_to_and() {
        let mut query = Query::new("A");
        query.greater_than("x", 1).greater_than("x", 5).equal_to("x", 7);
        assert_eq!(
            query.where_clause(),
            json!({"x": {"$gt": 1}, "$and": [{"x": {"$gt": 5}}, {"x": 7}]})
        );
    }

    #[test]
    fn test_string_matchers_quote_input() {
        let mut query = Query::new("A");
        query
            .starts_with("name", "a.b")
            .ends_with("title", "x\\Ey")
            .contains("body", "hi");
        let filter = query.where_clause();
        assert_eq!(filter["name"], json!({"$regex": "^\\Qa.b\\E"}));
        assert_eq!(filter["title"], json!({"$regex": "\\Qx\\E\\\\E\\Qy\\E$"}));
        assert_eq!(filter["body"], json!({"$regex": "\\Qhi\\E"}));
    }

    #[test]
    fn test_matches_with_modifiers() {
        let mut query = Query::new("A");
        query.matches("name", "^bob", "i");
        assert_eq!(
            query.where_clause(),
            json!({"name": {"$regex": "^bob", "$options": "i"}})
        );
    }

    #[test]
    fn test_geo_constraints() {
        let sf = GeoPoint::new(37.77, -122.42).unwrap();
        let mut query = Query::new("Place");
        query.within_kilometers("location", sf, EARTH_RADIUS_KM);
        let filter = query.where_clause();
        assert_eq!(filter["location"]["$maxDistance"], json!(1.0));
        assert_eq!(filter["location"]["$nearSphere"]["__type"], "GeoPoint");

        let mut boxed = Query::new("Place");
        boxed.within_geo_box(
            "location",
            GeoPoint::new(37.0, -123.0).unwrap(),
            GeoPoint::new(38.0, -122.0).unwrap(),
        );
        assert_eq!(
            boxed.where_clause()["location"]["$within"]["$box"][1]["latitude"],
            json!(38.0)
        );
    }

    #[test]
    fn test_subqueries() {
        let mut inner = Query::new("Post");
        inner.exists("image");

        let mut query = Query::new("Comment");
        query
            .matches_query("post", &inner)
            .does_not_match_key_in_query("author", "owner", &inner);
        let filter = query.where_clause();
        assert_eq!(
            filter["post"]["$inQuery"],
            json!({"className": "Post", "where": {"image": {"$exists": true}}})
        );
        assert_eq!(filter["author"]["$dontSelect"]["key"], "owner");
    }

    #[test]
    fn test_order_accumulates_and_clears() {
        let mut query = Query::new("A");
        query.ascending("score").descending("createdAt");
        let params = query.to_params();
        assert!(params.contains(&("order".to_string(), "score,-createdAt".to_string())));

        query.clear_order();
        assert!(!query.to_params().iter().any(|(k, _)| k == "order"));
    }

    #[test]
    fn test_params() {
        let mut query = Query::new("A");
        query
            .select(["name", "score"])
            .include("author")
            .include("author.team")
            .limit(10)
            .skip(20);
        let params = query.to_params();
        assert_eq!(
            params,
            vec![
                ("where".to_string(), "{}".to_string()),
                ("limit".to_string(), "10".to_string()),
                ("skip".to_string(), "20".to_string()),
                ("keys".to_string(), "name,score".to_string()),
                ("include".to_string(), "author,author.team".to_string()),
            ]
        );
    }

    #[test]
    fn test_or_requires_same_class() {
        let mut a = Query::new("A");
        a.equal_to("x", 1);
        let mut b = Query::new("A");
        b.equal_to("y", 2);

        let combined = Query::or(vec![a.clone(), b]).unwrap();
        assert_eq!(
            combined.where_clause(),
            json!({"$or": [{"x": 1}, {"y": 2}]})
        );

        let err = Query::or(vec![a, Query::new("B")]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidClassName);
        assert_eq!(
            Query::or(Vec::new()).unwrap_err().code(),
            ErrorCode::InvalidQuery
        );
    }

    #[tokio::test]
    async fn test_each_rejects_ordered_query() {
        let client = Client::new(crate::ClientConfig::builder("app").build()).unwrap();
        let mut query = Query::new("A");
        query.ascending("score");
        let err = query
            .each(&client, EachOptions::default(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidQuery);
    }
}
