//! Declarative import schemas, one per importable entity type.

use crate::import::lookup::LookupKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Text,
    Email,
    Date,
    Number,
    Enumerated,
    Lookup,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub required: bool,
    pub kind: ColumnKind,
    #[serde(skip_serializing_if = "no_values")]
    pub allowed_values: &'static [&'static str],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupKind>,
    /// Accepted chrono formats; the first one is canonical.
    #[serde(skip_serializing_if = "no_values")]
    pub date_formats: &'static [&'static str],
    pub example: &'static str,
    /// Persisted field the column writes to.
    #[serde(skip)]
    pub column: &'static str,
}

fn no_values(values: &&'static [&'static str]) -> bool {
    values.is_empty()
}

const ISO_OR_DAY_FIRST: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

impl ColumnSpec {
    const fn new(name: &'static str, label: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            label,
            required: false,
            kind,
            allowed_values: &[],
            lookup: None,
            date_formats: &[],
            example: "",
            column: name,
        }
    }

    const fn text(name: &'static str, label: &'static str) -> Self {
        Self::new(name, label, ColumnKind::Text)
    }

    const fn email(name: &'static str, label: &'static str) -> Self {
        Self::new(name, label, ColumnKind::Email)
    }

    const fn number(name: &'static str, label: &'static str) -> Self {
        Self::new(name, label, ColumnKind::Number)
    }

    const fn date(
        name: &'static str,
        label: &'static str,
        formats: &'static [&'static str],
    ) -> Self {
        Self {
            date_formats: formats,
            ..Self::new(name, label, ColumnKind::Date)
        }
    }

    const fn one_of(
        name: &'static str,
        label: &'static str,
        values: &'static [&'static str],
    ) -> Self {
        Self {
            allowed_values: values,
            ..Self::new(name, label, ColumnKind::Enumerated)
        }
    }

    const fn lookup(
        name: &'static str,
        label: &'static str,
        kind: LookupKind,
        column: &'static str,
    ) -> Self {
        Self {
            lookup: Some(kind),
            column,
            ..Self::new(name, label, ColumnKind::Lookup)
        }
    }

    const fn required(self) -> Self {
        Self {
            required: true,
            ..self
        }
    }

    const fn example(self, example: &'static str) -> Self {
        Self { example, ..self }
    }

    /// Name used for change records: the reference kind for lookups.
    pub fn change_field(&self) -> &'static str {
        match self.lookup {
            Some(kind) => kind.as_str(),
            None => self.name,
        }
    }
}

/// Secondary relationship created after the primary record, e.g. the
/// subjects a staff member teaches.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkSpec {
    pub column: &'static str,
    pub lookup: LookupKind,
    pub table: &'static str,
    pub owner_field: &'static str,
    pub target_field: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Staff,
    Students,
    ExamQuestions,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Staff, Self::Students, Self::ExamQuestions];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "staff" => Some(Self::Staff),
            "students" | "student" => Some(Self::Students),
            "exam_questions" | "questions" => Some(Self::ExamQuestions),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staff => "staff",
            Self::Students => "students",
            Self::ExamQuestions => "exam_questions",
        }
    }

    pub fn schema(self) -> &'static ImportSchema {
        match self {
            Self::Staff => &STAFF,
            Self::Students => &STUDENTS,
            Self::ExamQuestions => &EXAM_QUESTIONS,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSchema {
    pub entity: EntityKind,
    #[serde(skip)]
    pub table: &'static str,
    /// Business key column.
    pub key: &'static str,
    /// Second batch-uniqueness dimension.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<&'static str>,
    pub columns: &'static [ColumnSpec],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkSpec>,
}

impl ImportSchema {
    pub fn column(&self, name: &str) -> Option<&'static ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn key_spec(&self) -> &'static ColumnSpec {
        self.column(self.key).unwrap_or(&self.columns[0])
    }

    pub fn unique_spec(&self) -> Option<&'static ColumnSpec> {
        self.unique.and_then(|u| self.column(u))
    }

    pub fn is_link(&self, name: &str) -> bool {
        self.link.map(|l| l.column == name).unwrap_or(false)
    }

    /// Columns that map onto a persisted field of the entity itself.
    pub fn field_columns(&self) -> impl Iterator<Item = &'static ColumnSpec> + '_ {
        self.columns.iter().filter(move |c| !self.is_link(c.name))
    }

    pub fn header(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

pub fn schema_for(entity_type: &str) -> Option<&'static ImportSchema> {
    EntityKind::parse(entity_type).map(EntityKind::schema)
}

const GENDERS: &[&str] = &["male", "female", "other"];
const STAFF_ROLES: &[&str] = &["teacher", "administrator", "accountant", "librarian", "support"];
const QUESTION_TYPES: &[&str] = &["multiple_choice", "true_false", "short_answer", "essay"];
const DIFFICULTIES: &[&str] = &["easy", "medium", "hard"];

static STAFF: ImportSchema = ImportSchema {
    entity: EntityKind::Staff,
    table: "staff",
    key: "employee_no",
    unique: Some("email"),
    columns: &[
        ColumnSpec::text("employee_no", "Employee No.").required().example("EMP001"),
        ColumnSpec::text("first_name", "First Name").required().example("Jane"),
        ColumnSpec::text("middle_name", "Middle Name"),
        ColumnSpec::text("last_name", "Last Name").required().example("Doe"),
        ColumnSpec::email("email", "Email").example("jane.doe@school.edu"),
        ColumnSpec::text("phone", "Phone").example("+254700000001"),
        ColumnSpec::one_of("gender", "Gender", GENDERS).example("female"),
        ColumnSpec::one_of("role", "Role", STAFF_ROLES).required().example("teacher"),
        ColumnSpec::date("date_joined", "Date Joined", ISO_OR_DAY_FIRST).example("2023-01-09"),
        ColumnSpec::text("subjects", "Subjects").example("MATH;ENG"),
    ],
    link: Some(LinkSpec {
        column: "subjects",
        lookup: LookupKind::Subject,
        table: "staff_subjects",
        owner_field: "staff_id",
        target_field: "subject_id",
    }),
};

static STUDENTS: ImportSchema = ImportSchema {
    entity: EntityKind::Students,
    table: "students",
    key: "admission_no",
    unique: Some("email"),
    columns: &[
        ColumnSpec::text("admission_no", "Admission No.").required().example("STU001"),
        ColumnSpec::text("first_name", "First Name").required().example("Amani"),
        ColumnSpec::text("middle_name", "Middle Name"),
        ColumnSpec::text("last_name", "Last Name").required().example("Otieno"),
        ColumnSpec::one_of("gender", "Gender", GENDERS).required().example("male"),
        ColumnSpec::date("date_of_birth", "Date of Birth", ISO_OR_DAY_FIRST).example("2015-04-21"),
        ColumnSpec::email("email", "Email").example("amani.otieno@school.edu"),
        ColumnSpec::text("guardian_phone", "Guardian Phone").example("+254700000002"),
        ColumnSpec::lookup("class_name", "Class", LookupKind::Class, "class_id")
            .required()
            .example("Grade 2 A"),
    ],
    link: None,
};

static EXAM_QUESTIONS: ImportSchema = ImportSchema {
    entity: EntityKind::ExamQuestions,
    table: "exam_questions",
    key: "question_code",
    unique: None,
    columns: &[
        ColumnSpec::text("question_code", "Question Code").required().example("Q-001"),
        ColumnSpec::lookup("subject", "Subject", LookupKind::Subject, "subject_id")
            .required()
            .example("MATH"),
        ColumnSpec::lookup("class_name", "Class", LookupKind::Class, "class_id").example("Grade 2 A"),
        ColumnSpec::one_of("question_type", "Question Type", QUESTION_TYPES)
            .required()
            .example("multiple_choice"),
        ColumnSpec::one_of("difficulty", "Difficulty", DIFFICULTIES).example("medium"),
        ColumnSpec::number("marks", "Marks").required().example("2"),
        ColumnSpec::text("question_text", "Question").required().example("What is 7 x 8?"),
        ColumnSpec::text("correct_answer", "Correct Answer").example("56"),
    ],
    link: None,
};
