//! C2 — process-tree construction.
//!
//! A [`ProcessBuilder`] holds a table of named templates, keyed by intent.
//! Given an [`Analysis`] (and, optionally, a pre-execution [`Hypothesis`]
//! from C11), it instantiates the matching template into a concrete
//! [`ProcessTree`]: fresh [`StepId`]s, parameters copied in from the
//! analysis, declared dependencies resolved by name, an inferred-dependency
//! pass for steps that didn't declare their own, and a cycle check before
//! the tree is handed back (the full leveling/topological-sort pass is
//! [`crate::dependency`]'s job; this module only refuses to hand out a tree
//! with an internal contradiction).

use std::collections::BTreeMap;

use crate::error::{BuildError, Result};
use crate::types::{Analysis, Hypothesis, PlanId, ProcessStep, ProcessTree, StepId, StepType};

/// A template step: like [`ProcessStep`] but referring to other steps in
/// the *same template* by name rather than by [`crate::types::StepId`],
/// since ids are only assigned at instantiation time.
#[derive(Debug, Clone)]
pub struct TemplateStep {
    /// Name unique within the owning template.
    pub name: String,
    /// What kind of work this step performs.
    pub step_type: StepType,
    /// Names of steps within the same template this one depends on.
    pub depends_on: Vec<String>,
    /// Parameter names this step requires from the analysis' parameter map.
    /// Missing parameters fail instantiation with
    /// [`BuildError::MissingParameter`].
    pub required_parameters: Vec<String>,
    /// Whether a failed dependency should be tolerated (see
    /// [`ProcessStep::optional_dependencies`]).
    pub optional_dependencies: bool,
}

impl TemplateStep {
    /// Construct a required step with no dependencies.
    pub fn new(name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            name: name.into(),
            step_type,
            depends_on: Vec::new(),
            required_parameters: Vec::new(),
            optional_dependencies: false,
        }
    }

    /// Add a dependency on another step, by name, within the same template.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Require a named analysis parameter to be present at instantiation.
    #[must_use]
    pub fn requires(mut self, parameter: impl Into<String>) -> Self {
        self.required_parameters.push(parameter.into());
        self
    }

    /// Mark this step's dependencies as optional (see
    /// [`ProcessStep::optional_dependencies`]).
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional_dependencies = true;
        self
    }
}

/// How a template's step list is produced.
#[derive(Debug, Clone)]
enum TemplateShape {
    /// A fixed step list, known at registration time.
    Static(Vec<TemplateStep>),
    /// A step list computed from the analysis being built, e.g. one
    /// `search_E`/`analyze_E` pair per compared entity.
    Dynamic(fn(&Analysis) -> std::result::Result<Vec<TemplateStep>, BuildError>),
}

/// A named template: a fixed (or analysis-dependent) shape of steps for one
/// intent.
#[derive(Debug, Clone)]
pub struct ProcessTemplate {
    shape: TemplateShape,
}

impl Default for ProcessTemplate {
    fn default() -> Self {
        Self {
            shape: TemplateShape::Static(Vec::new()),
        }
    }
}

impl ProcessTemplate {
    /// Start an empty static template.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step to a static template.
    ///
    /// # Panics
    /// Panics if called on a [`ProcessTemplate::dynamic`] template — mixing
    /// the two shapes is a template-authoring bug, not a runtime condition.
    #[must_use]
    pub fn with_step(mut self, step: TemplateStep) -> Self {
        match &mut self.shape {
            TemplateShape::Static(steps) => steps.push(step),
            TemplateShape::Dynamic(_) => {
                panic!("cannot add a static step to a dynamic template")
            }
        }
        self
    }

    /// Build a template whose step list is computed from the [`Analysis`]
    /// at instantiation time, rather than fixed in advance.
    pub fn dynamic(f: fn(&Analysis) -> std::result::Result<Vec<TemplateStep>, BuildError>) -> Self {
        Self {
            shape: TemplateShape::Dynamic(f),
        }
    }

    fn instantiate(&self, analysis: &Analysis) -> Result<Vec<TemplateStep>> {
        match &self.shape {
            TemplateShape::Static(steps) => Ok(steps.clone()),
            TemplateShape::Dynamic(f) => Ok(f(analysis)?),
        }
    }
}

/// Canonical per-intent templates (spec §4.2). Each entry's step sequence
/// matches the spec's table of local names/dependencies one-for-one so the
/// end-to-end scenarios in §8 produce the exact plan shapes they describe.
pub fn canonical_templates() -> BTreeMap<String, ProcessTemplate> {
    let mut templates = BTreeMap::new();

    templates.insert(
        "procedure_query".to_string(),
        ProcessTemplate::new()
            .with_step(TemplateStep::new("search_requirements", StepType::Search))
            .with_step(TemplateStep::new("search_forms", StepType::Search))
            .with_step(
                TemplateStep::new("synthesize_checklist", StepType::Synthesis)
                    .depends_on("search_requirements")
                    .depends_on("search_forms"),
            ),
    );

    templates.insert(
        "comparison".to_string(),
        ProcessTemplate::dynamic(comparison_template),
    );

    templates.insert(
        "calculation".to_string(),
        ProcessTemplate::new()
            .with_step(TemplateStep::new("search_rates", StepType::Search))
            .with_step(
                TemplateStep::new("compute", StepType::Calculation).depends_on("search_rates"),
            ),
    );

    templates.insert(
        "fact_retrieval".to_string(),
        ProcessTemplate::new()
            .with_step(TemplateStep::new("search_fact", StepType::Search))
            .with_step(
                TemplateStep::new("validate", StepType::Validation).depends_on("search_fact"),
            ),
    );

    templates.insert(
        "definition".to_string(),
        ProcessTemplate::new().with_step(TemplateStep::new("search_definition", StepType::Search)),
    );

    templates.insert(
        "explanation".to_string(),
        ProcessTemplate::new()
            .with_step(TemplateStep::new("search_context", StepType::Search))
            .with_step(
                TemplateStep::new("synthesize_explanation", StepType::Synthesis)
                    .depends_on("search_context"),
            ),
    );

    templates.insert(
        "recommendation".to_string(),
        ProcessTemplate::new()
            .with_step(TemplateStep::new("search_options", StepType::Search))
            .with_step(
                TemplateStep::new("analyze_options", StepType::Analysis)
                    .depends_on("search_options"),
            )
            .with_step(
                TemplateStep::new("recommend", StepType::Synthesis).depends_on("analyze_options"),
            ),
    );

    templates.insert(
        "timeline".to_string(),
        ProcessTemplate::new()
            .with_step(TemplateStep::new("search_events", StepType::Search))
            .with_step(
                TemplateStep::new("order_events", StepType::Presentation)
                    .depends_on("search_events"),
            ),
    );

    templates.insert(
        "other".to_string(),
        ProcessTemplate::new().with_step(TemplateStep::new("search_generic", StepType::Search)),
    );

    templates
}

/// The `comparison` template's per-entity expansion: one `search_E` /
/// `analyze_E(deps: search_E)` pair for each compared entity, followed by a
/// single `compare` step depending on every `analyze_*` step.
///
/// Reads the compared entities from `analysis.parameters["compared_entities"]`
/// (pipe-separated, set by [`crate::analysis::Analyzer`]); at least two are
/// required to form a comparison.
fn comparison_template(
    analysis: &Analysis,
) -> std::result::Result<Vec<TemplateStep>, BuildError> {
    let raw = analysis
        .parameters
        .get("compared_entities")
        .ok_or_else(|| BuildError::MissingParameter {
            template: "comparison".to_string(),
            parameter: "compared_entities".to_string(),
        })?;

    let entities: Vec<&str> = raw.split('|').map(str::trim).filter(|s| !s.is_empty()).collect();
    if entities.len() < 2 {
        return Err(BuildError::MissingParameter {
            template: "comparison".to_string(),
            parameter: "compared_entities".to_string(),
        });
    }

    let mut steps = Vec::with_capacity(entities.len() * 2 + 1);
    let mut analyze_names = Vec::with_capacity(entities.len());
    for entity in &entities {
        let slug = slugify(entity);
        let search_name = format!("search_{slug}");
        let analyze_name = format!("analyze_{slug}");

        steps.push(
            TemplateStep::new(search_name.clone(), StepType::Search)
                .requires("compared_entities"),
        );
        steps.push(
            TemplateStep::new(analyze_name.clone(), StepType::Analysis).depends_on(search_name),
        );
        analyze_names.push(analyze_name);
    }

    let mut compare = TemplateStep::new("compare", StepType::Comparison);
    for name in analyze_names {
        compare = compare.depends_on(name);
    }
    steps.push(compare);

    Ok(steps)
}

/// Lowercases and replaces runs of non-alphanumeric characters with a
/// single underscore, for use as a step-name suffix.
fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_sep = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep && !slug.is_empty() {
            slug.push('_');
            last_was_sep = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("entity");
    }
    slug
}

/// Builds [`ProcessTree`]s from [`Analysis`] output by looking up a
/// registered [`ProcessTemplate`] for the analysis' intent.
#[derive(Debug, Clone, Default)]
pub struct ProcessBuilder {
    templates: BTreeMap<String, ProcessTemplate>,
}

impl ProcessBuilder {
    /// Start with no templates registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with the canonical per-intent templates from spec §4.2
    /// already registered.
    pub fn with_canonical_templates() -> Self {
        Self {
            templates: canonical_templates(),
        }
    }

    /// Register a template under the given intent label.
    #[must_use]
    pub fn register(mut self, intent: impl Into<String>, template: ProcessTemplate) -> Self {
        self.templates.insert(intent.into(), template);
        self
    }

    /// Build a [`ProcessTree`] for the given analysis.
    ///
    /// If `hypothesis` reports a critical missing-information gap, the
    /// normal template is bypassed entirely in favor of a single terminal
    /// `clarification_request` step (spec §4.2, §8 scenario 5).
    ///
    /// # Errors
    /// - [`BuildError::UnknownIntent`] if no template is registered for
    ///   `analysis.intent`.
    /// - [`BuildError::MissingParameter`] if a template step requires a
    ///   parameter the analysis did not supply.
    /// - [`BuildError::CycleDetected`] if the template's dependency names
    ///   (declared or inferred) form a cycle — a template authoring bug,
    ///   but checked here rather than trusted, since templates may be
    ///   built programmatically.
    pub fn build(
        &self,
        analysis: &Analysis,
        hypothesis: Option<&Hypothesis>,
    ) -> Result<ProcessTree> {
        if let Some(hypothesis) = hypothesis {
            if hypothesis.has_critical_gap() {
                return Ok(clarification_tree(hypothesis));
            }
        }

        let template = self
            .templates
            .get(&analysis.intent)
            .ok_or_else(|| BuildError::UnknownIntent(analysis.intent.clone()))?;

        let tmpl_steps = template.instantiate(analysis)?;

        for step in &tmpl_steps {
            for param in &step.required_parameters {
                if !analysis.parameters.contains_key(param) {
                    return Err(BuildError::MissingParameter {
                        template: analysis.intent.clone(),
                        parameter: param.clone(),
                    }
                    .into());
                }
            }
        }

        let name_to_id: BTreeMap<String, StepId> = tmpl_steps
            .iter()
            .map(|s| (s.name.clone(), StepId::new()))
            .collect();

        let mut steps = BTreeMap::new();
        for tmpl_step in &tmpl_steps {
            let id = name_to_id[&tmpl_step.name];
            let depends_on: Vec<_> = tmpl_step
                .depends_on
                .iter()
                .map(|dep_name| {
                    name_to_id.get(dep_name).copied().ok_or_else(|| {
                        BuildError::MissingParameter {
                            template: analysis.intent.clone(),
                            parameter: format!("unknown dependency `{dep_name}`"),
                        }
                    })
                })
                .collect::<std::result::Result<_, _>>()?;

            let mut parameters = BTreeMap::new();
            for param in &tmpl_step.required_parameters {
                if let Some(value) = analysis.parameters.get(param) {
                    parameters.insert(param.clone(), value.clone());
                }
            }

            steps.insert(
                id,
                ProcessStep {
                    id,
                    name: tmpl_step.name.clone(),
                    step_type: tmpl_step.step_type,
                    depends_on,
                    parameters,
                    optional_dependencies: tmpl_step.optional_dependencies,
                },
            );
        }

        infer_dependencies(&mut steps, &name_to_id);

        let roots = steps
            .values()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id)
            .collect();

        let tree = ProcessTree {
            plan_id: PlanId::new(),
            steps,
            roots,
        };

        detect_template_cycle(&tree)?;

        Ok(tree)
    }
}

/// A single terminal step short-circuiting the plan when a hypothesis
/// reports a critical gap (spec §4.2, §8 scenario 5). The final output is
/// a form schema, not prose.
fn clarification_tree(hypothesis: &Hypothesis) -> ProcessTree {
    let id = StepId::new();
    let missing = hypothesis.critical_gap_descriptions();
    let mut parameters = BTreeMap::new();
    parameters.insert("missing_information".to_string(), missing.join("|"));
    if let Some(clarification) = &hypothesis.clarification {
        parameters.insert("clarification".to_string(), clarification.clone());
    }

    let mut steps = BTreeMap::new();
    steps.insert(
        id,
        ProcessStep {
            id,
            name: "clarification_request".to_string(),
            step_type: StepType::ClarificationRequest,
            depends_on: Vec::new(),
            parameters,
            optional_dependencies: false,
        },
    );

    ProcessTree {
        plan_id: PlanId::new(),
        steps,
        roots: vec![id],
    }
}

/// Step types whose job is to combine upstream results, and therefore
/// benefit from the inferred-dependency pass below.
fn combines_upstream(step_type: StepType) -> bool {
    matches!(
        step_type,
        StepType::Synthesis | StepType::Comparison | StepType::Validation
    )
}

/// Beyond declared dependencies, link every synthesis/comparison/validation
/// step that has no declared dependency of its own to the union of the
/// producers of steps it names in its own `required_parameters` — mirroring
/// the spec's "union of its input-name's producers" rule for templates that
/// don't spell out every edge explicitly. A step that already declares at
/// least one dependency is left untouched: explicit edges always win.
fn infer_dependencies(steps: &mut BTreeMap<StepId, ProcessStep>, name_to_id: &BTreeMap<String, StepId>) {
    let producer_of_param: BTreeMap<String, StepId> = steps
        .values()
        .flat_map(|step| step.parameters.keys().map(move |param| (param.clone(), step.id)))
        .collect();

    let candidates: Vec<StepId> = steps
        .values()
        .filter(|s| combines_upstream(s.step_type) && s.depends_on.is_empty())
        .map(|s| s.id)
        .collect();

    for id in candidates {
        let inferred: Vec<StepId> = {
            let step = &steps[&id];
            step.parameters
                .keys()
                .filter_map(|param| producer_of_param.get(param).copied())
                .filter(|producer| *producer != id)
                .collect()
        };
        if !inferred.is_empty() {
            steps.get_mut(&id).unwrap().depends_on = inferred;
        }
    }

    // `name_to_id` is only needed by callers that want to resolve inferred
    // edges back to template-local names for diagnostics; unused here but
    // kept in the signature so future inference rules (e.g. name-based
    // heuristics beyond shared parameters) don't need a signature change.
    let _ = name_to_id;
}

/// Detect a cycle in the freshly instantiated tree using a simple
/// depth-first walk with a recursion-stack marker. Full leveling (and its
/// own, independent cycle check for externally supplied trees) lives in
/// [`crate::dependency`]; this is a cheap sanity check at construction time
/// so a broken template fails fast with a clear error.
fn detect_template_cycle(tree: &ProcessTree) -> Result<()> {
    use std::collections::BTreeSet;

    #[derive(PartialEq, Eq, Clone, Copy)]
    enum Mark {
        InProgress,
        Done,
    }

    let mut marks: BTreeMap<StepId, Mark> = BTreeMap::new();
    let mut stack_path = Vec::new();

    fn visit(
        id: StepId,
        tree: &ProcessTree,
        marks: &mut BTreeMap<StepId, Mark>,
        stack_path: &mut Vec<StepId>,
    ) -> std::result::Result<(), Vec<StepId>> {
        match marks.get(&id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let start = stack_path.iter().position(|s| *s == id).unwrap_or(0);
                return Err(stack_path[start..].to_vec());
            }
            None => {}
        }
        marks.insert(id, Mark::InProgress);
        stack_path.push(id);
        if let Some(step) = tree.step(id) {
            for dep in &step.depends_on {
                visit(*dep, tree, marks, stack_path)?;
            }
        }
        stack_path.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    let mut seen = BTreeSet::new();
    for id in tree.steps.keys() {
        if seen.insert(*id) {
            if let Err(cycle) = visit(*id, tree, &mut marks, &mut stack_path) {
                return Err(BuildError::CycleDetected(cycle).into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MissingInfoSeverity, MissingInformation, Query};

    fn builder() -> ProcessBuilder {
        ProcessBuilder::new().register(
            "lookup",
            ProcessTemplate::new()
                .with_step(TemplateStep::new("retrieve", StepType::Retrieval))
                .with_step(
                    TemplateStep::new("synthesize", StepType::Synthesis).depends_on("retrieve"),
                )
                .with_step(
                    TemplateStep::new("answer", StepType::FinalAnswer).depends_on("synthesize"),
                ),
        )
    }

    fn analysis(intent: &str) -> Analysis {
        Analysis {
            intent: intent.to_string(),
            question_type: "statement".to_string(),
            entities: vec![],
            jurisdiction: None,
            ambiguity: 0.1,
            confidence: 0.9,
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn builds_tree_with_correct_roots() {
        let tree = builder().build(&analysis("lookup"), None).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.roots.len(), 1);
        let root = tree.step(tree.roots[0]).unwrap();
        assert_eq!(root.name, "retrieve");
    }

    #[test]
    fn unknown_intent_fails() {
        let err = builder().build(&analysis("unregistered"), None).unwrap_err();
        assert!(matches!(err, crate::error::Error::Build(BuildError::UnknownIntent(_))));
    }

    #[test]
    fn missing_parameter_fails() {
        let builder = ProcessBuilder::new().register(
            "calculate",
            ProcessTemplate::new()
                .with_step(TemplateStep::new("compute", StepType::Calculation).requires("amount")),
        );
        let err = builder.build(&analysis("calculate"), None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Build(BuildError::MissingParameter { .. })
        ));
    }

    #[test]
    fn cyclic_template_is_rejected() {
        let builder = ProcessBuilder::new().register(
            "broken",
            ProcessTemplate::new()
                .with_step(TemplateStep::new("a", StepType::Analysis).depends_on("b"))
                .with_step(TemplateStep::new("b", StepType::Analysis).depends_on("a")),
        );
        let err = builder.build(&analysis("broken"), None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Build(BuildError::CycleDetected(_))
        ));
    }

    #[test]
    fn query_new_carries_no_hints() {
        let query = Query::new("hello");
        assert!(query.jurisdiction_hint.is_none());
    }

    #[test]
    fn procedure_query_template_matches_scenario_one() {
        let builder = ProcessBuilder::with_canonical_templates();
        let tree = builder.build(&analysis("procedure_query"), None).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.roots.len(), 2);
        let checklist = tree
            .steps
            .values()
            .find(|s| s.name == "synthesize_checklist")
            .unwrap();
        assert_eq!(checklist.depends_on.len(), 2);
    }

    #[test]
    fn comparison_template_expands_one_pair_per_entity_then_joins_in_compare() {
        let mut a = analysis("comparison");
        a.parameters
            .insert("compared_entities".to_string(), "GmbH|AG".to_string());

        let builder = ProcessBuilder::with_canonical_templates();
        let tree = builder.build(&a, None).unwrap();

        assert_eq!(tree.len(), 5, "search_GmbH, search_AG, analyze_GmbH, analyze_AG, compare");
        assert_eq!(tree.roots.len(), 2);

        let compare = tree.steps.values().find(|s| s.name == "compare").unwrap();
        assert_eq!(compare.depends_on.len(), 2);

        let analyze_gmbh = tree
            .steps
            .values()
            .find(|s| s.name == "analyze_gmbh")
            .expect("analyze step for GmbH");
        assert_eq!(analyze_gmbh.depends_on.len(), 1);
    }

    #[test]
    fn comparison_template_without_enough_entities_fails() {
        let a = analysis("comparison");
        let builder = ProcessBuilder::with_canonical_templates();
        let err = builder.build(&a, None).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Build(BuildError::MissingParameter { .. })
        ));
    }

    #[test]
    fn calculation_template_matches_scenario_three() {
        let builder = ProcessBuilder::with_canonical_templates();
        let tree = builder.build(&analysis("calculation"), None).unwrap();
        assert_eq!(tree.len(), 2);
        let compute = tree.steps.values().find(|s| s.name == "compute").unwrap();
        assert_eq!(compute.depends_on.len(), 1);
    }

    #[test]
    fn fact_retrieval_template_matches_scenario_four() {
        let builder = ProcessBuilder::with_canonical_templates();
        let tree = builder.build(&analysis("fact_retrieval"), None).unwrap();
        assert_eq!(tree.len(), 2);
        assert!(tree.steps.values().any(|s| s.name == "validate"));
    }

    #[test]
    fn critical_hypothesis_gap_short_circuits_to_clarification_request() {
        let builder = ProcessBuilder::with_canonical_templates();
        let hypothesis = Hypothesis {
            summary: "uncertain".to_string(),
            confidence: 0.2,
            required_criteria: vec!["jurisdiction".to_string()],
            available_information: vec![],
            missing_information: vec![MissingInformation {
                item: "Bundesland".to_string(),
                severity: MissingInfoSeverity::Critical,
            }],
            clarification: Some("Which Bundesland does this apply to?".to_string()),
            estimated_complexity: crate::types::ComplexityTier::Moderate,
            recommended_token_budget: 1536,
        };

        let tree = builder
            .build(&analysis("procedure_query"), Some(&hypothesis))
            .unwrap();

        assert_eq!(tree.len(), 1);
        let only = tree.step(tree.roots[0]).unwrap();
        assert_eq!(only.step_type, StepType::ClarificationRequest);
        assert_eq!(only.parameters.get("missing_information").unwrap(), "Bundesland");
    }

    #[test]
    fn non_critical_hypothesis_gap_does_not_short_circuit() {
        let builder = ProcessBuilder::with_canonical_templates();
        let hypothesis = Hypothesis {
            summary: "mostly clear".to_string(),
            confidence: 0.8,
            required_criteria: vec!["jurisdiction".to_string()],
            available_information: vec![],
            missing_information: vec![MissingInformation {
                item: "preferred format".to_string(),
                severity: MissingInfoSeverity::Optional,
            }],
            clarification: None,
            estimated_complexity: crate::types::ComplexityTier::Simple,
            recommended_token_budget: 512,
        };

        let tree = builder
            .build(&analysis("definition"), Some(&hypothesis))
            .unwrap();
        assert_eq!(tree.len(), 1);
        assert_ne!(
            tree.step(tree.roots[0]).unwrap().step_type,
            StepType::ClarificationRequest
        );
    }
}
