//! Query engine
//!
//! All lookups read merged state (`*Merge` over every still-unmerged part)
//! from the permanent tables, grouped by the table key.
//!
//! Stored orientation decides how the caller's term is compared:
//!
//! | column | stored as | compared with |
//! |---|---|---|
//! | `tuples.query` | reversed | reversed normalized term |
//! | `tuples.answer` | natural | normalized or literal term |
//! | `individual.value`, `which = 'Q'` | reversed | reversed normalized term |
//! | `individual.value`, `which = 'A'` | natural | normalized or literal term |
//!
//! Suffix lookups stop at label boundaries: `example.com` matches
//! `mail.example.com` but not `notexample.com`.

use super::client::Engine;
use super::schema::{INDIVIDUAL, TUPLES};
use crate::error::{Stage, StageExt, StoreError};
use crate::reverse::{natural_suffix_pattern, reversed_suffix_pattern};
use crate::store::{
    unreverse_individuals, unreverse_tuples, IndividualResult, LookupTerm, TupleResult,
};

const TUPLE_SELECT: &str = "SELECT query, type, answer, \
     anyLastMerge(ttl) AS ttl_last, \
     toUnixTimestamp(minMerge(first)) AS first_seen, \
     toUnixTimestamp(maxMerge(last)) AS last_seen, \
     sumMerge(count) AS seen";

const INDIVIDUAL_SELECT: &str = "SELECT which, value, \
     toUnixTimestamp(minMerge(first)) AS first_seen, \
     toUnixTimestamp(maxMerge(last)) AS last_seen, \
     sumMerge(count) AS seen";

fn tuple_sql(predicate: &str) -> String {
    format!(
        "{} FROM {} WHERE {} GROUP BY query, type, answer ORDER BY query, answer, type",
        TUPLE_SELECT, TUPLES, predicate
    )
}

fn individual_sql(predicate: &str) -> String {
    format!(
        "{} FROM {} WHERE {} GROUP BY which, value ORDER BY value, which",
        INDIVIDUAL_SELECT, INDIVIDUAL, predicate
    )
}

pub struct QueryEngine<'a> {
    engine: &'a dyn Engine,
}

impl<'a> QueryEngine<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self { engine }
    }

    pub async fn find_query_tuples(&self, query: &str) -> Result<Vec<TupleResult>, StoreError> {
        let term = LookupTerm::new(query);
        let sql = tuple_sql("query = {rq:String}");
        self.tuples(&sql, vec![("rq", term.reversed)], Stage::FindQueryTuples).await
    }

    pub async fn find_tuples(&self, name: &str) -> Result<Vec<TupleResult>, StoreError> {
        let term = LookupTerm::new(name);
        let sql = tuple_sql("query = {rq:String} OR answer IN ({q:String}, {q_raw:String})");
        self.tuples(
            &sql,
            vec![("rq", term.reversed), ("q", term.name), ("q_raw", term.literal)],
            Stage::FindTuples,
        )
        .await
    }

    pub async fn like_tuples(&self, suffix: &str) -> Result<Vec<TupleResult>, StoreError> {
        let term = LookupTerm::new(suffix);
        let sql = tuple_sql(
            "query = {rq:String} OR query LIKE {rq_like:String} \
             OR answer IN ({q:String}, {q_raw:String}) OR answer LIKE {q_like:String}",
        );
        self.tuples(
            &sql,
            vec![
                ("rq_like", reversed_suffix_pattern(&term.reversed)),
                ("rq", term.reversed),
                ("q_like", natural_suffix_pattern(&term.name)),
                ("q", term.name),
                ("q_raw", term.literal),
            ],
            Stage::LikeTuples,
        )
        .await
    }

    pub async fn find_individual(&self, value: &str) -> Result<Vec<IndividualResult>, StoreError> {
        let term = LookupTerm::new(value);
        let sql = individual_sql(
            "(which = 'A' AND value IN ({v:String}, {v_raw:String})) \
             OR (which = 'Q' AND value = {rv:String})",
        );
        self.individuals(
            &sql,
            vec![("v", term.name), ("v_raw", term.literal), ("rv", term.reversed)],
            Stage::FindIndividual,
        )
        .await
    }

    pub async fn like_individual(&self, suffix: &str) -> Result<Vec<IndividualResult>, StoreError> {
        let term = LookupTerm::new(suffix);
        let sql = individual_sql(
            "(which = 'A' AND (value IN ({v:String}, {v_raw:String}) \
             OR value LIKE {v_like:String})) \
             OR (which = 'Q' AND (value = {rv:String} OR value LIKE {rv_like:String}))",
        );
        self.individuals(
            &sql,
            vec![
                ("v_like", natural_suffix_pattern(&term.name)),
                ("v", term.name),
                ("v_raw", term.literal),
                ("rv_like", reversed_suffix_pattern(&term.reversed)),
                ("rv", term.reversed),
            ],
            Stage::LikeIndividual,
        )
        .await
    }

    async fn tuples(
        &self,
        sql: &str,
        params: Vec<(&str, String)>,
        stage: Stage,
    ) -> Result<Vec<TupleResult>, StoreError> {
        let rows = self.engine.select(sql, &params).await.at(stage)?;
        let mut results = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<TupleResult>, _>>()
            .at(stage)?;
        unreverse_tuples(&mut results);
        Ok(results)
    }

    async fn individuals(
        &self,
        sql: &str,
        params: Vec<(&str, String)>,
        stage: Stage,
    ) -> Result<Vec<IndividualResult>, StoreError> {
        let rows = self.engine.select(sql, &params).await.at(stage)?;
        let mut results = rows
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<IndividualResult>, _>>()
            .at(stage)?;
        unreverse_individuals(&mut results);
        Ok(results)
    }
}
