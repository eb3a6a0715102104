//! Wire resources served to the library-management client.
//!
//! The client expects PascalCase field names and a denormalized shape: an
//! author embeds every work, and every work embeds every edition. A single
//! book is always serialized as a work envelope containing exactly one book;
//! the controller relies on every "book" payload being self-describing that
//! way.

use serde::{Deserialize, Serialize};

/// Response shape for the bulk book endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkBookResource {
    #[serde(rename = "Works")]
    pub works: Vec<WorkResource>,
    #[serde(rename = "Series")]
    pub series: Vec<SeriesResource>,
    #[serde(rename = "Authors")]
    pub authors: Vec<AuthorResource>,
}

/// The abstract entity shared across editions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,
    /// This is what's ultimately displayed in the app.
    #[serde(rename = "Title")]
    pub title: String,
    /// The title + subtitle.
    #[serde(rename = "FullTitle")]
    pub full_title: String,
    /// Just the title.
    #[serde(rename = "ShortTitle")]
    pub short_title: String,
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "ReleaseDate", skip_serializing_if = "String::is_empty")]
    pub release_date: String,
    #[serde(rename = "Genres")]
    pub genres: Vec<String>,
    #[serde(rename = "RelatedWorks")]
    pub related_works: Vec<i64>,

    #[serde(rename = "Books")]
    pub books: Vec<BookResource>,
    #[serde(rename = "Series")]
    pub series: Vec<SeriesResource>,
    #[serde(rename = "Authors")]
    pub authors: Vec<AuthorResource>,

    /// Upstream-canonical key, distinct from the legacy numeric ID.
    #[serde(rename = "KCA")]
    pub kca: String,
    #[serde(rename = "BestBookId")]
    pub best_book_id: i64,
}

/// An author with every work, each carrying every edition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "ImageUrl")]
    pub image_url: String,
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "RatingCount")]
    pub rating_count: i64,
    #[serde(rename = "AverageRating")]
    pub average_rating: f32,

    #[serde(rename = "Works")]
    pub works: Vec<WorkResource>,
    #[serde(rename = "Series")]
    pub series: Vec<SeriesResource>,

    #[serde(rename = "KCA")]
    pub kca: String,
}

/// A single printed or digital edition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,
    #[serde(rename = "Asin")]
    pub asin: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Isbn13", skip_serializing_if = "String::is_empty")]
    pub isbn13: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "FullTitle")]
    pub full_title: String,
    #[serde(rename = "ShortTitle")]
    pub short_title: String,
    #[serde(rename = "Language")]
    pub language: String,
    #[serde(rename = "Format")]
    pub format: String,
    #[serde(rename = "EditionInformation")]
    pub edition_information: String,
    #[serde(rename = "Publisher")]
    pub publisher: String,
    #[serde(rename = "ImageUrl")]
    pub image_url: String,
    #[serde(rename = "IsEbook")]
    pub is_ebook: bool,
    #[serde(rename = "NumPages")]
    pub num_pages: i64,
    #[serde(rename = "RatingCount")]
    pub rating_count: i64,
    #[serde(rename = "RatingSum")]
    pub rating_sum: i64,
    #[serde(rename = "AverageRating")]
    pub average_rating: f64,
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "ReleaseDate", skip_serializing_if = "String::is_empty")]
    pub release_date: String,

    #[serde(rename = "Contributors")]
    pub contributors: Vec<ContributorResource>,

    #[serde(rename = "KCA")]
    pub kca: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Description")]
    pub description: String,

    #[serde(rename = "LinkItems")]
    pub link_items: Vec<SeriesWorkLinkResource>,

    #[serde(rename = "KCA")]
    pub kca: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesWorkLinkResource {
    #[serde(rename = "ForeignWorkId")]
    pub foreign_work_id: i64,
    #[serde(rename = "PositionInSeries")]
    pub position_in_series: String,
    #[serde(rename = "SeriesPosition")]
    pub series_position: i32,
    #[serde(rename = "Primary")]
    pub primary: bool,
}

/// A book references exactly one primary author through its contributors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContributorResource {
    #[serde(rename = "ForeignId")]
    pub foreign_id: i64,
    #[serde(rename = "Role")]
    pub role: String,
}
